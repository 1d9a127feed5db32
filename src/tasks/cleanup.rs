//! TTL Cleanup Task
//!
//! Background task that periodically removes expired cache entries, so
//! responses that are never read again do not linger until evicted.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::SharedCache;

/// Spawns a background task that periodically sweeps expired entries.
///
/// Each sweep takes the write lock once. The returned handle is aborted
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache = cache::shared(CacheStore::new(1000));
/// let cleanup_handle = spawn_cleanup_task(cache.clone(), 30);
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(cache: SharedCache, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let period = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            interval_secs = period.as_secs(),
            "starting cache expiry sweep"
        );

        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let removed = cache.write().await.cleanup_expired();

            if removed > 0 {
                info!(removed, "expired cache entries swept");
            } else {
                debug!("expiry sweep found nothing to remove");
            }
        }
    })
}
