//! Remote Fetcher
//!
//! Authenticated access to the CRM REST API. GET responses go through the
//! shared cache; every physical request passes the rate gate first.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{Params, SharedCache, TtlPolicy};
use crate::client::throttle::{remaining_quota, RateGate, Throttle};
use crate::config::Config;
use crate::error::FetchError;

// == Fetcher Settings ==
/// Everything the fetcher needs besides the cache.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub base_url: String,
    pub api_key: String,
    /// Sent as `X-System`
    pub system_name: String,
    pub timeout: Duration,
    pub throttle: Throttle,
    pub ttl_policy: TtlPolicy,
}

impl FetcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.api_base.clone(),
            api_key: config.api_key.clone(),
            system_name: config.system_name.clone(),
            timeout: config.request_timeout(),
            throttle: Throttle::from_config(config),
            ttl_policy: TtlPolicy::standard(Duration::from_secs(config.cache_default_ttl)),
        }
    }
}

// == Remote Fetcher ==
/// Client for the remote CRM.
#[derive(Debug)]
pub struct RemoteFetcher {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    system_name: String,
    cache: SharedCache,
    ttl_policy: TtlPolicy,
    throttle: Throttle,
    gate: RateGate,
}

impl RemoteFetcher {
    /// Builds a fetcher writing successful GET responses into `cache`.
    pub fn new(settings: FetcherSettings, cache: SharedCache) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key,
            system_name: settings.system_name,
            cache,
            ttl_policy: settings.ttl_policy,
            gate: RateGate::new(settings.throttle.request_delay),
            throttle: settings.throttle,
        })
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    // == Request ==
    /// Performs one call against the remote API.
    ///
    /// GET requests are answered from cache when possible. A 429 waits out
    /// the cooldown and then fails with [`FetchError::RateLimited`]; the
    /// caller decides whether to retry.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
        body: Option<&Value>,
    ) -> Result<Value, FetchError> {
        let is_get = method == Method::GET;

        if is_get {
            if let Some(cached) = self.cache.write().await.get(endpoint, params) {
                debug!(endpoint, "served from cache");
                return Ok(cached);
            }
        }

        self.gate.pass().await;

        let mut request = self
            .http
            .request(method.clone(), self.url(endpoint))
            .basic_auth(&self.api_key, Some(""))
            .header("X-System", &self.system_name)
            .header("X-System-Key", &self.api_key)
            .query(&query_pairs(params));
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, endpoint, "calling remote API");
        let response = request.send().await?;
        let status = response.status();

        if is_get {
            if let Some(extra) = remaining_quota(response.headers())
                .and_then(|remaining| self.throttle.quota_delay(remaining))
            {
                debug!(endpoint, delay_ms = extra.as_millis() as u64, "remote quota running low");
                tokio::time::sleep(extra).await;
            }
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(endpoint, "remote rate limit hit, cooling down");
            tokio::time::sleep(self.throttle.rate_limit_cooldown).await;
            return Err(FetchError::RateLimited);
        }

        let text = response.text().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                body: serde_json::from_str(&text).ok(),
            });
        }

        let payload = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        if is_get {
            let ttl = self.ttl_policy.ttl_for(endpoint);
            self.cache
                .write()
                .await
                .set(endpoint, params, payload.clone(), ttl);
        }

        Ok(payload)
    }

    pub async fn get(&self, endpoint: &str, params: &Params) -> Result<Value, FetchError> {
        self.request(Method::GET, endpoint, params, None).await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, FetchError> {
        self.request(Method::POST, endpoint, &Params::new(), Some(body))
            .await
    }

    pub async fn put(&self, endpoint: &str, body: &Value) -> Result<Value, FetchError> {
        self.request(Method::PUT, endpoint, &Params::new(), Some(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Value, FetchError> {
        self.request(Method::DELETE, endpoint, &Params::new(), None)
            .await
    }

    /// Drops cached responses whose source contains `pattern`.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        self.cache.write().await.invalidate(pattern)
    }

    pub async fn invalidate_resource(&self, prefix: &str) -> usize {
        self.cache.write().await.invalidate_resource(prefix)
    }
}

/// Flattens JSON parameters into query pairs.
///
/// Arrays repeat the key, nulls are skipped, nested objects are sent as JSON.
pub fn query_pairs(params: &Params) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len());
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = scalar_text(item) {
                        pairs.push((key.clone(), text));
                    }
                }
            }
            other => {
                if let Some(text) = scalar_text(other) {
                    pairs.push((key.clone(), text));
                }
            }
        }
    }
    pairs
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

/// Resource prefix of an endpoint: `/people/12/notes` -> `/people`.
pub fn resource_prefix(endpoint: &str) -> String {
    let trimmed = endpoint.trim_start_matches('/');
    let first = trimmed.split(['/', '?']).next().unwrap_or_default();
    format!("/{}", first)
}
