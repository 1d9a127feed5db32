//! API Handlers
//!
//! HTTP request handlers for each bridge endpoint.

use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::info;

use crate::cache::{self, CacheReport, CacheStore, SharedCache};
use crate::config::Config;
use crate::error::{AppError, FetchError, Result};
use crate::models::{
    FetchJob, FetchRequest, FetchResponse, HealthResponse, InvalidateRequest, InvalidateResponse,
    JobEnvelope, MutateRequest, MutateResponse,
};
use crate::pipeline::QueryService;

/// Application state shared across all handlers.
///
/// The cache handle is the same one the service's fetcher writes into.
#[derive(Clone)]
pub struct AppState {
    pub cache: SharedCache,
    pub service: Arc<QueryService>,
}

impl AppState {
    pub fn new(cache: SharedCache, service: QueryService) -> Self {
        Self {
            cache,
            service: Arc::new(service),
        }
    }

    /// Builds the cache and the query service from configuration.
    pub fn from_config(config: &Config) -> std::result::Result<Self, FetchError> {
        let cache = cache::shared(CacheStore::with_enabled(
            config.cache_max_size,
            config.cache_enabled,
        ));
        let service = QueryService::from_config(config, cache.clone())?;
        Ok(Self::new(cache, service))
    }
}

/// Handler for POST /query
///
/// Runs a fetch job. Job-level failures are part of the envelope, so this
/// always answers 200 once the body parses.
pub async fn query_handler(
    State(state): State<AppState>,
    Json(job): Json<FetchJob>,
) -> Json<JobEnvelope> {
    Json(state.service.run(job).await)
}

/// Handler for POST /fetch
pub async fn fetch_handler(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }

    Ok(Json(state.service.fetch_one(req).await))
}

/// Handler for POST /mutate
///
/// Remote failures map to 429 or 502 through [`AppError`].
pub async fn mutate_handler(
    State(state): State<AppState>,
    Json(req): Json<MutateRequest>,
) -> Result<Json<MutateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(AppError::InvalidRequest(error_msg));
    }

    Ok(Json(state.service.mutate(req).await?))
}

/// Handler for GET /cache/stats
pub async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheReport> {
    // Read lock is enough: stats do not promote entries
    let cache = state.cache.read().await;
    Json(cache.stats())
}

/// Handler for POST /cache/invalidate
///
/// A missing body or blank pattern clears the whole cache.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    req: Option<Json<InvalidateRequest>>,
) -> Json<InvalidateResponse> {
    let pattern = req
        .and_then(|Json(req)| req.pattern)
        .filter(|pattern| !pattern.trim().is_empty());

    let removed = state.cache.write().await.invalidate(pattern.as_deref());
    info!(removed, pattern = ?pattern, "cache invalidated");

    Json(InvalidateResponse { removed, pattern })
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Params, TtlPolicy};
    use crate::client::{FetcherSettings, RemoteFetcher, Throttle};
    use crate::models::MutationMethod;
    use crate::query::QueryExecutor;
    use serde_json::json;
    use std::time::Duration;

    fn test_state() -> AppState {
        let cache = cache::shared(CacheStore::new(100));
        let settings = FetcherSettings {
            base_url: "http://127.0.0.1:9".into(),
            api_key: "key".into(),
            system_name: "tests".into(),
            timeout: Duration::from_secs(2),
            throttle: Throttle::none(),
            ttl_policy: TtlPolicy::new(Duration::from_secs(60)),
        };
        let fetcher = RemoteFetcher::new(settings, cache.clone()).unwrap();
        let service = QueryService::new(Arc::new(fetcher), QueryExecutor::default(), 100);
        AppState::new(cache, service)
    }

    #[tokio::test]
    async fn test_invalidate_handler_with_pattern() {
        let state = test_state();
        {
            let mut cache = state.cache.write().await;
            let ttl = Duration::from_secs(60);
            cache.set("/people", &Params::new(), json!({"people": []}), ttl);
            cache.set("/deals", &Params::new(), json!({"deals": []}), ttl);
        }

        let req = InvalidateRequest {
            pattern: Some("/people".to_string()),
        };
        let response = invalidate_handler(State(state.clone()), Some(Json(req))).await;
        assert_eq!(response.removed, 1);
        assert_eq!(response.pattern.as_deref(), Some("/people"));
        assert_eq!(state.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_handler_without_body_clears_all() {
        let state = test_state();
        state.cache.write().await.set(
            "/users",
            &Params::new(),
            json!({"users": []}),
            Duration::from_secs(60),
        );

        let response = invalidate_handler(State(state.clone()), None).await;
        assert_eq!(response.removed, 1);
        assert!(response.pattern.is_none());
    }

    #[tokio::test]
    async fn test_cache_stats_handler() {
        let state = test_state();
        let response = cache_stats_handler(State(state)).await;
        assert!(response.enabled);
        assert_eq!(response.size, 0);
        assert_eq!(response.max_size, 100);
    }

    #[tokio::test]
    async fn test_fetch_handler_rejects_bad_endpoint() {
        let req = FetchRequest {
            endpoint: "people".into(),
            params: Params::new(),
            date_field: None,
            date_range: None,
            page_size: None,
        };
        let result = fetch_handler(State(test_state()), Json(req)).await;
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_mutate_handler_requires_body() {
        let req = MutateRequest {
            method: MutationMethod::Post,
            endpoint: "/people".into(),
            body: None,
        };
        let result = mutate_handler(State(test_state()), Json(req)).await;
        assert!(matches!(result, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_query_handler_reports_invalid_job_in_envelope() {
        let job: FetchJob = serde_json::from_value(json!({"description": "empty"})).unwrap();
        let response = query_handler(State(test_state()), Json(job)).await;
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }
}
