//! Integration Tests for API Endpoints
//!
//! Tests the full request/response cycle of each endpoint against a mock CRM.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use crm_bridge::api::create_router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// == Helper Functions ==

fn create_test_app(server: &MockServer) -> Router {
    create_router(common::app_state(server))
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn mount_people(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_metadata": {"total": 3},
            "people": [
                {"id": 1, "source": "Zillow"},
                {"id": 2, "source": "Website"},
                {"id": 3, "source": "Zillow"}
            ]
        })))
        .mount(server)
        .await;
}

// == Query Endpoint Tests ==

#[tokio::test]
async fn test_query_endpoint_success() {
    let server = MockServer::start().await;
    mount_people(&server).await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(post_json(
            "/query",
            json!({
                "description": "Leads by source",
                "endpoints": [{"endpoint": "/people"}],
                "processing": "utils.countBy(data['people'], 'source')"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["results"], json!({"Zillow": 2, "Website": 1}));
    assert_eq!(json["performance"]["totalRecordsFetched"], 3);
}

#[tokio::test]
async fn test_query_endpoint_invalid_job() {
    let server = MockServer::start().await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(post_json(
            "/query",
            json!({"description": "bad", "endpoints": [{"endpoint": "people"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "Query execution failed");
    assert!(json["recommendation"].is_string());
}

#[tokio::test]
async fn test_query_endpoint_malformed_body() {
    let server = MockServer::start().await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/query")
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

// == Fetch Endpoint Tests ==

#[tokio::test]
async fn test_fetch_endpoint_returns_records() {
    let server = MockServer::start().await;
    mount_people(&server).await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(post_json("/fetch", json!({"endpoint": "/people", "pageSize": 10})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["endpoint"], "/people");
    assert_eq!(json["recordCount"], 3);
    assert_eq!(json["requests"], 1);
    assert!(json.get("error").is_none());
}

// == Mutate Endpoint Tests ==

#[tokio::test]
async fn test_mutate_endpoint_forwards_remote_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"errorMessage": "Invalid email"})))
        .mount(&server)
        .await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(post_json(
            "/mutate",
            json!({"method": "POST", "endpoint": "/people", "body": {"emails": ["nope"]}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["remoteStatus"], 422);
    assert_eq!(json["remoteBody"]["errorMessage"], "Invalid email");
}

#[tokio::test]
async fn test_mutate_endpoint_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/tasks/5"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let app = create_test_app(&server);

    let response = app
        .oneshot(post_json("/mutate", json!({"method": "DELETE", "endpoint": "/tasks/5"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

// == Cache Endpoint Tests ==

#[tokio::test]
async fn test_cache_stats_and_invalidate() {
    let server = MockServer::start().await;
    mount_people(&server).await;
    let app = create_test_app(&server);

    let response = app
        .clone()
        .oneshot(post_json("/fetch", json!({"endpoint": "/people"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = body_to_json(
        app.clone()
            .oneshot(get("/cache/stats"))
            .await
            .unwrap()
            .into_body(),
    )
    .await;
    assert_eq!(stats["enabled"], true);
    assert_eq!(stats["size"], 1);
    assert_eq!(stats["misses"], 1);
    assert!(stats["entries"][0]["source"].as_str().unwrap().starts_with("/people"));

    let removed = body_to_json(
        app.clone()
            .oneshot(post_json("/cache/invalidate", json!({"pattern": "/deals"})))
            .await
            .unwrap()
            .into_body(),
    )
    .await;
    assert_eq!(removed, json!({"removed": 0, "pattern": "/deals"}));

    let removed = body_to_json(
        app.oneshot(post_json("/cache/invalidate", json!({})))
            .await
            .unwrap()
            .into_body(),
    )
    .await;
    assert_eq!(removed, json!({"removed": 1, "pattern": null}));
}

// == Health Endpoint Tests ==

#[tokio::test]
async fn test_health_endpoint() {
    let server = MockServer::start().await;
    let app = create_test_app(&server);

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
}
