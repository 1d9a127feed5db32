//! Integration Tests for the Remote Fetcher
//!
//! Runs the fetcher and the pagination loop against a mock CRM.

mod common;

use crm_bridge::cache::Params;
use crm_bridge::client::{DateWindow, PageQuery, Throttle};
use crm_bridge::error::FetchError;
use crm_bridge::models::DateRange;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn page(key: &str, total: u64, records: Value) -> ResponseTemplate {
    let mut body = serde_json::Map::new();
    body.insert("_metadata".into(), json!({"total": total}));
    body.insert(key.into(), records);
    ResponseTemplate::new(200).set_body_json(Value::Object(body))
}

fn params(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

// == Single Requests ==

#[tokio::test]
async fn test_get_sends_credentials_and_system_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(header("authorization", common::BASIC_AUTH))
        .and(header("X-System", common::SYSTEM_NAME))
        .and(header("X-System-Key", common::API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": []})))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher(&server);
    let body = fetcher.get("/users", &Params::new()).await.unwrap();
    assert_eq!(body, json!({"users": []}));
}

#[tokio::test]
async fn test_cache_hit_avoids_second_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stages": [{"id": 1}]})))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, cache) = common::fetcher(&server);
    let query = params(json!({"limit": 10}));

    let first = fetcher.get("/stages", &query).await.unwrap();
    let second = fetcher.get("/stages", &query).await.unwrap();
    assert_eq!(first, second);

    let report = cache.read().await.stats();
    assert_eq!(report.hits, 1);
    assert_eq!(report.size, 1);
}

#[tokio::test]
async fn test_writes_are_never_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
        .expect(2)
        .mount(&server)
        .await;

    let (fetcher, cache) = common::fetcher(&server);
    let note = json!({"personId": 1, "body": "hello"});
    fetcher.post("/notes", &note).await.unwrap();
    fetcher.post("/notes", &note).await.unwrap();

    assert!(cache.read().await.is_empty());
}

#[tokio::test]
async fn test_rate_limited_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let (fetcher, cache) = common::fetcher(&server);
    let err = fetcher.get("/people", &Params::new()).await.unwrap_err();

    assert!(matches!(err, FetchError::RateLimited));
    assert!(cache.read().await.is_empty());
}

#[tokio::test]
async fn test_http_error_carries_remote_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/deals"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"errorMessage": "Invalid field 'foo'"})),
        )
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher(&server);
    let err = fetcher.get("/deals", &Params::new()).await.unwrap_err();

    match &err {
        FetchError::Http { status, body } => {
            assert_eq!(*status, 400);
            assert_eq!(body.as_ref().unwrap()["errorMessage"], "Invalid field 'foo'");
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
    assert!(err.detail().contains("Invalid field"));
}

#[tokio::test]
async fn test_low_quota_header_still_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-remaining", "3")
                .set_body_json(json!({"tasks": []})),
        )
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher(&server);
    assert!(fetcher.get("/tasks", &Params::new()).await.is_ok());
}

// == Throttling ==

fn throttle(request_delay: u64, low_quota_delay: u64, rate_limit_cooldown: u64) -> Throttle {
    Throttle {
        request_delay: Duration::from_millis(request_delay),
        low_quota_delay: Duration::from_millis(low_quota_delay),
        moderate_quota_delay: Duration::ZERO,
        rate_limit_cooldown: Duration::from_millis(rate_limit_cooldown),
    }
}

#[tokio::test]
async fn test_request_delay_applies_once_per_physical_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stages": []})))
        .expect(2)
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher_with_throttle(&server, throttle(150, 0, 0));

    let started = Instant::now();
    fetcher.get("/stages", &Params::new()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    // Cache hit: no gate, no delay
    let started = Instant::now();
    fetcher.get("/stages", &Params::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));

    // Different params miss the cache and pay the delay again
    let started = Instant::now();
    fetcher.get("/stages", &params(json!({"limit": 5}))).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_low_quota_adds_extra_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tasks"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-remaining", "3")
                .set_body_json(json!({"tasks": []})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/notes"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-remaining", "900")
                .set_body_json(json!({"notes": []})),
        )
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher_with_throttle(&server, throttle(0, 200, 0));

    let started = Instant::now();
    fetcher.get("/tasks", &Params::new()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));

    let started = Instant::now();
    fetcher.get("/notes", &Params::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_rate_limit_waits_cooldown_before_failing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher_with_throttle(&server, throttle(0, 0, 250));

    let started = Instant::now();
    let err = fetcher.get("/people", &Params::new()).await.unwrap_err();

    assert!(matches!(err, FetchError::RateLimited));
    assert!(started.elapsed() >= Duration::from_millis(250));
}

// == Pagination ==

#[tokio::test]
async fn test_pagination_stops_at_total() {
    let server = MockServer::start().await;
    for (offset, ids) in [("0", vec![1, 2]), ("2", vec![3, 4]), ("4", vec![5])] {
        let records: Vec<Value> = ids.into_iter().map(|id| json!({"id": id})).collect();
        Mock::given(method("GET"))
            .and(path("/people"))
            .and(query_param("limit", "2"))
            .and(query_param("offset", offset))
            .respond_with(page("people", 5, Value::Array(records)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let (fetcher, _) = common::fetcher(&server);
    let run = fetcher
        .fetch_all_pages(&PageQuery::new("/people", Params::new(), 2))
        .await;

    assert_eq!(run.records.len(), 5);
    assert_eq!(run.requests, 3);
    assert!(run.error.is_none());
    let ids: Vec<i64> = run.records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_date_window_stops_early() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/calls"))
        .and(query_param("offset", "0"))
        .respond_with(page(
            "calls",
            100,
            json!([
                {"id": 1, "created": "2025-06-20T09:00:00Z"},
                {"id": 2, "created": "2025-06-10T09:00:00Z"}
            ]),
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/calls"))
        .and(query_param("offset", "2"))
        .respond_with(page(
            "calls",
            100,
            json!([
                {"id": 3, "created": "2025-05-31T09:00:00Z"},
                {"id": 4, "created": "2025-05-20T09:00:00Z"}
            ]),
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/calls"))
        .and(query_param("offset", "4"))
        .respond_with(page("calls", 100, json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let range = DateRange {
        start: "2025-06-01".into(),
        end: "2025-06-30".into(),
    };
    let query = PageQuery::new("/calls", Params::new(), 2)
        .with_window(DateWindow::parse("created", &range));

    let (fetcher, _) = common::fetcher(&server);
    let run = fetcher.fetch_all_pages(&query).await;

    assert_eq!(run.requests, 2);
    let ids: Vec<i64> = run.records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_pagination_error_keeps_earlier_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(query_param("offset", "0"))
        .respond_with(page("events", 4, json!([{"id": 1}, {"id": 2}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"errorMessage": "boom"})))
        .mount(&server)
        .await;

    let (fetcher, _) = common::fetcher(&server);
    let run = fetcher
        .fetch_all_pages(&PageQuery::new("/events", Params::new(), 2))
        .await;

    assert_eq!(run.records.len(), 2);
    assert!(matches!(run.error, Some(FetchError::Http { status: 500, .. })));
}

#[tokio::test]
async fn test_caller_limit_caps_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/people"))
        .and(query_param("limit", "3"))
        .and(query_param("offset", "10"))
        .respond_with(page(
            "people",
            500,
            json!([{"id": 11}, {"id": 12}, {"id": 13}]),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let query = PageQuery::from_caller_params(
        "/people",
        params(json!({"limit": 3, "offset": 10})),
        100,
    );
    let (fetcher, _) = common::fetcher(&server);
    let run = fetcher.fetch_all_pages(&query).await;

    assert_eq!(run.records.len(), 3);
    assert_eq!(run.requests, 1);
}
