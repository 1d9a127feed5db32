//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crm_bridge::cache::{self, CacheStore, SharedCache, TtlPolicy};
use crm_bridge::client::{FetcherSettings, RemoteFetcher, Throttle};
use crm_bridge::pipeline::QueryService;
use crm_bridge::query::QueryExecutor;
use crm_bridge::AppState;
use wiremock::MockServer;

pub const API_KEY: &str = "secret";
pub const SYSTEM_NAME: &str = "bridge-tests";

/// Basic auth header for `API_KEY` with an empty password.
pub const BASIC_AUTH: &str = "Basic c2VjcmV0Og==";

pub fn settings(server: &MockServer) -> FetcherSettings {
    FetcherSettings {
        base_url: server.uri(),
        api_key: API_KEY.to_string(),
        system_name: SYSTEM_NAME.to_string(),
        timeout: Duration::from_secs(5),
        throttle: Throttle::none(),
        ttl_policy: TtlPolicy::standard(Duration::from_secs(60)),
    }
}

pub fn fetcher(server: &MockServer) -> (RemoteFetcher, SharedCache) {
    fetcher_with_throttle(server, Throttle::none())
}

pub fn fetcher_with_throttle(server: &MockServer, throttle: Throttle) -> (RemoteFetcher, SharedCache) {
    let cache = cache::shared(CacheStore::new(100));
    let settings = FetcherSettings {
        throttle,
        ..settings(server)
    };
    let fetcher = RemoteFetcher::new(settings, cache.clone()).unwrap();
    (fetcher, cache)
}

pub fn service(server: &MockServer, page_size: usize) -> (QueryService, SharedCache) {
    let (fetcher, cache) = fetcher(server);
    let service = QueryService::new(Arc::new(fetcher), QueryExecutor::default(), page_size);
    (service, cache)
}

pub fn app_state(server: &MockServer) -> AppState {
    let (service, cache) = service(server, 100);
    AppState::new(cache, service)
}
