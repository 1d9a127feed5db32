//! Cache Module
//!
//! Process-lifetime response cache keyed by request fingerprint, with
//! per-endpoint TTL policy and LRU eviction.

mod entry;
mod fingerprint;
mod lru;
mod policy;
mod stats;
mod store;


use std::sync::Arc;

use tokio::sync::RwLock;

// Re-export public types
pub use entry::CacheEntry;
pub use fingerprint::{canonical_json, fingerprint, fingerprint_source, Params};
pub use lru::LruTracker;
pub use policy::TtlPolicy;
pub use stats::{CacheReport, CacheStats, EntryReport};
pub use store::CacheStore;

/// Cache handle shared by the fetcher, the mutation handlers and the sweeper.
///
/// Lookups need the write lock: expire-on-read and LRU promotion both mutate.
pub type SharedCache = Arc<RwLock<CacheStore>>;

/// Wraps a store into a [`SharedCache`].
pub fn shared(store: CacheStore) -> SharedCache {
    Arc::new(RwLock::new(store))
}
