//! Cache Statistics Module
//!
//! Hit/miss/eviction counters plus the per-entry introspection report.

use serde::Serialize;

// == Cache Stats ==
/// Running counters kept by the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries dropped by the LRU bound
    pub evictions: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// hits / (hits + misses), or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }
}

// == Entry Report ==
/// Observability view of one cached entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryReport {
    /// Fingerprint of the request
    pub key: String,
    /// `endpoint:params` the fingerprint was derived from
    pub source: String,
    pub age_seconds: f64,
    pub ttl_seconds: f64,
    /// Seconds until expiry, zero when already stale
    pub expires_in_seconds: f64,
}

// == Cache Report ==
/// Snapshot returned by `CacheStore::stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    pub enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    /// Ordered from least to most recently used
    pub entries: Vec<EntryReport>,
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_record_eviction() {
        let mut stats = CacheStats::new();
        stats.record_eviction();
        stats.record_eviction();
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = CacheReport {
            enabled: true,
            size: 0,
            max_size: 10,
            hits: 0,
            misses: 0,
            evictions: 0,
            hit_rate: 0.0,
            entries: vec![],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["maxSize"], 10);
        assert_eq!(json["enabled"], true);
    }
}
