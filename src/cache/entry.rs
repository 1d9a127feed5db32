//! Cache Entry Module
//!
//! A cached remote response together with its expiry metadata.

use std::time::{Duration, Instant};

use serde_json::Value;

// == Cache Entry ==
/// One cached parent response.
///
/// Entries are never mutated after creation; an overwrite replaces the
/// whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached response body
    pub payload: Value,
    /// Fingerprint source string (`endpoint:params`), matched by invalidation
    pub source: String,
    /// Insertion instant
    pub created_at: Instant,
    /// Lifetime granted at insertion
    pub ttl: Duration,
    /// Instant from which the entry is stale
    pub expires_at: Instant,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry that expires `ttl` from now.
    pub fn new(payload: Value, source: String, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            payload,
            source,
            created_at: now,
            ttl,
            expires_at: now + ttl,
        }
    }

    // == Is Expired ==
    /// An entry is expired once the current instant reaches `expires_at`.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time elapsed since insertion.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Remaining lifetime, zero once expired.
    pub fn ttl_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(json!({"people": []}), "/people:{}".into(), Duration::from_secs(60));

        assert_eq!(entry.payload, json!({"people": []}));
        assert_eq!(entry.source, "/people:{}");
        assert_eq!(entry.expires_at - entry.created_at, Duration::from_secs(60));
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_entry_expiration() {
        let entry = CacheEntry::new(json!(1), "/calls:{}".into(), Duration::from_millis(1));

        sleep(Duration::from_millis(2));

        assert!(entry.is_expired());
        assert_eq!(entry.ttl_remaining(), Duration::ZERO);
    }

    #[test]
    fn test_ttl_remaining() {
        let entry = CacheEntry::new(json!(1), "/deals:{}".into(), Duration::from_secs(10));

        let remaining = entry.ttl_remaining();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining >= Duration::from_secs(9));
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let entry = CacheEntry::new(json!(null), "/x:{}".into(), Duration::ZERO);
        assert!(entry.is_expired(), "Entry should be expired at boundary");
    }
}
