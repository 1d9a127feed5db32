//! Remote Client Module
//!
//! Throttled, cache-aware access to the CRM REST API and the paginating
//! fetch loop built on it.

mod fetcher;
mod pagination;
mod throttle;

pub use fetcher::{query_pairs, resource_prefix, FetcherSettings, RemoteFetcher};
pub use pagination::{DateWindow, PageOutcome, PageQuery, PageRun, METADATA_KEY};
pub use throttle::{remaining_quota, RateGate, Throttle, LOW_QUOTA, MODERATE_QUOTA, RATE_LIMIT_REMAINING};
