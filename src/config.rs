//! Configuration Module
//!
//! Handles loading and managing bridge configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Default remote API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.followupboss.com/v1";

/// Bridge configuration parameters.
///
/// Everything except the API key has a sensible default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential sent with every remote call
    pub api_key: String,
    /// Remote API base URL
    pub api_base: String,
    /// Value of the `X-System` identification header
    pub system_name: String,
    /// Fixed delay before every physical request, in milliseconds
    pub rate_limit_delay_ms: u64,
    /// Page size used by paginated fetches
    pub max_page_size: usize,
    /// Largest serialized transformation result, in megabytes
    pub max_result_size_mb: u64,
    /// Whether GET responses are cached
    pub cache_enabled: bool,
    /// Maximum number of cached responses
    pub cache_max_size: usize,
    /// Fallback TTL in seconds for endpoints without a policy entry
    pub cache_default_ttl: u64,
    /// Whether transformation snippets run at all
    pub processing_enabled: bool,
    /// Per-call HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// HTTP server port
    pub server_port: u16,
    /// Background expiry sweep interval in seconds
    pub cleanup_interval: u64,
}

impl Config {
    /// Creates a new Config from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    ///
    /// # Environment Variables
    /// - `CRM_API_KEY` - Remote API key (required)
    /// - `CRM_API_BASE` - Remote base URL (default: Follow Up Boss v1)
    /// - `CRM_SYSTEM_NAME` - `X-System` header (default: crm_bridge)
    /// - `RATE_LIMIT_DELAY_MS` - Inter-request delay (default: 50)
    /// - `MAX_PAGE_SIZE` - Pagination page size (default: 100)
    /// - `MAX_RESULT_SIZE_MB` - Transformation output limit (default: 10)
    /// - `ENABLE_CACHING` - Cache GET responses (default: true)
    /// - `CACHE_MAX_SIZE` - Maximum cache entries (default: 1000)
    /// - `CACHE_DEFAULT_TTL` - Fallback TTL in seconds (default: 60)
    /// - `ENABLE_CUSTOM_PROCESSING` - Run snippets (default: true)
    /// - `REQUEST_TIMEOUT_SECS` - HTTP timeout (default: 30)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CLEANUP_INTERVAL` - Expiry sweep frequency in seconds (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("CRM_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("CRM_API_KEY"))?;

        let defaults = Self::default();

        Ok(Self {
            api_key,
            api_base: lookup("CRM_API_BASE").unwrap_or(defaults.api_base),
            system_name: lookup("CRM_SYSTEM_NAME").unwrap_or(defaults.system_name),
            rate_limit_delay_ms: parse_or(&lookup, "RATE_LIMIT_DELAY_MS", defaults.rate_limit_delay_ms)?,
            max_page_size: parse_or(&lookup, "MAX_PAGE_SIZE", defaults.max_page_size)?,
            max_result_size_mb: parse_or(&lookup, "MAX_RESULT_SIZE_MB", defaults.max_result_size_mb)?,
            cache_enabled: parse_bool_or(&lookup, "ENABLE_CACHING", defaults.cache_enabled)?,
            cache_max_size: parse_or(&lookup, "CACHE_MAX_SIZE", defaults.cache_max_size)?,
            cache_default_ttl: parse_or(&lookup, "CACHE_DEFAULT_TTL", defaults.cache_default_ttl)?,
            processing_enabled: parse_bool_or(
                &lookup,
                "ENABLE_CUSTOM_PROCESSING",
                defaults.processing_enabled,
            )?,
            request_timeout_secs: parse_or(&lookup, "REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
            cleanup_interval: parse_or(&lookup, "CLEANUP_INTERVAL", defaults.cleanup_interval)?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            system_name: "crm_bridge".to_string(),
            rate_limit_delay_ms: 50,
            max_page_size: 100,
            max_result_size_mb: 10,
            cache_enabled: true,
            cache_max_size: 1000,
            cache_default_ttl: 60,
            processing_enabled: true,
            request_timeout_secs: 30,
            server_port: 3000,
            cleanup_interval: 30,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_bool_or<F>(lookup: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}
