//! Cache Store Module
//!
//! Fingerprint-keyed response storage combining a HashMap with LRU tracking
//! and lazy TTL expiration.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::cache::{
    fingerprint, fingerprint_source, CacheEntry, CacheReport, CacheStats, EntryReport,
    LruTracker, Params,
};

// == Cache Store ==
/// Bounded response cache.
///
/// Operations never fail: a miss and a broken entry look the same to the
/// caller.
#[derive(Debug)]
pub struct CacheStore {
    /// Fingerprint -> entry
    entries: HashMap<String, CacheEntry>,
    /// Recency order of fingerprints
    lru: LruTracker,
    stats: CacheStats,
    max_size: usize,
    enabled: bool,
}

impl CacheStore {
    // == Constructor ==
    /// Creates an enabled store holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self::with_enabled(max_size, true)
    }

    /// Creates a store, possibly disabled.
    ///
    /// A disabled store misses every lookup and ignores writes.
    pub fn with_enabled(max_size: usize, enabled: bool) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: CacheStats::new(),
            max_size,
            enabled,
        }
    }

    // == Get ==
    /// Returns the cached payload for a request.
    ///
    /// Expired entries are removed and reported as a miss; a hit becomes the
    /// most recently used entry.
    pub fn get(&mut self, endpoint: &str, params: &Params) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        let key = fingerprint(endpoint, params);
        let expired = match self.entries.get(&key) {
            None => {
                self.stats.record_miss();
                return None;
            }
            Some(entry) => entry.is_expired(),
        };

        if expired {
            self.entries.remove(&key);
            self.lru.remove(&key);
            self.stats.record_miss();
            debug!(endpoint, "cache entry expired on read");
            return None;
        }

        self.lru.touch(&key);
        self.stats.record_hit();
        self.entries.get(&key).map(|entry| entry.payload.clone())
    }

    // == Set ==
    /// Stores a payload, replacing any entry for the same request.
    ///
    /// If the insertion pushes the store over its bound, the least recently
    /// used entry is evicted.
    pub fn set(&mut self, endpoint: &str, params: &Params, payload: Value, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let key = fingerprint(endpoint, params);
        let entry = CacheEntry::new(payload, fingerprint_source(endpoint, params), ttl);
        self.entries.insert(key.clone(), entry);
        self.lru.touch(&key);

        if self.entries.len() > self.max_size {
            if let Some(evicted) = self.lru.evict_oldest() {
                self.entries.remove(&evicted);
                self.stats.record_eviction();
                debug!(evicted = %evicted, "evicted least recently used cache entry");
            }
        }
    }

    // == Invalidate ==
    /// Drops entries whose source contains `pattern`, or everything when no
    /// pattern is given. Returns the number removed.
    pub fn invalidate(&mut self, pattern: Option<&str>) -> usize {
        if !self.enabled {
            return 0;
        }

        match pattern {
            None => {
                let count = self.entries.len();
                self.entries.clear();
                self.lru.clear();
                count
            }
            Some(pattern) => self.remove_where(|source| source.contains(pattern)),
        }
    }

    /// Drops cached reads of one resource: `prefix` itself and its sub-paths
    /// (`/people`, `/people/12`) but not `/peopleRelationships`.
    pub fn invalidate_resource(&mut self, prefix: &str) -> usize {
        if !self.enabled {
            return 0;
        }
        self.remove_where(|source| {
            source
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(':') || rest.starts_with('/'))
        })
    }

    fn remove_where(&mut self, doomed_source: impl Fn(&str) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| doomed_source(&entry.source))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.entries.remove(key);
            self.lru.remove(key);
        }
        doomed.len()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries and returns how many were dropped.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.entries.remove(key);
            self.lru.remove(key);
        }

        expired_keys.len()
    }

    // == Stats ==
    /// Introspection snapshot, entries ordered from least to most recently used.
    pub fn stats(&self) -> CacheReport {
        let entries = self
            .lru
            .iter()
            .filter_map(|key| {
                self.entries.get(key).map(|entry| EntryReport {
                    key: key.clone(),
                    source: entry.source.clone(),
                    age_seconds: entry.age().as_secs_f64(),
                    ttl_seconds: entry.ttl.as_secs_f64(),
                    expires_in_seconds: entry.ttl_remaining().as_secs_f64(),
                })
            })
            .collect();

        CacheReport {
            enabled: self.enabled,
            size: self.entries.len(),
            max_size: self.max_size,
            hits: self.stats.hits,
            misses: self.stats.misses,
            evictions: self.stats.evictions,
            hit_rate: self.stats.hit_rate(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    const MINUTE: Duration = Duration::from_secs(60);

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_store_set_and_get() {
        let mut store = CacheStore::new(100);
        let p = params(json!({"limit": 10}));

        store.set("/people", &p, json!({"people": [{"id": 1}]}), MINUTE);

        assert_eq!(store.get("/people", &p), Some(json!({"people": [{"id": 1}]})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_param_order_is_irrelevant() {
        let mut store = CacheStore::new(100);
        let mut ab = Params::new();
        ab.insert("a".into(), json!(1));
        ab.insert("b".into(), json!(2));
        store.set("/deals", &ab, json!("cached"), MINUTE);

        let mut ba = Params::new();
        ba.insert("b".into(), json!(2));
        ba.insert("a".into(), json!(1));
        assert_eq!(store.get("/deals", &ba), Some(json!("cached")));
    }

    #[test]
    fn test_store_get_nonexistent() {
        let mut store = CacheStore::new(100);
        assert_eq!(store.get("/people", &Params::new()), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_store_overwrite() {
        let mut store = CacheStore::new(100);
        let p = Params::new();

        store.set("/stages", &p, json!(1), MINUTE);
        store.set("/stages", &p, json!(2), MINUTE);

        assert_eq!(store.get("/stages", &p), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_ttl_expiration_is_not_resurrected() {
        let mut store = CacheStore::new(100);
        let p = Params::new();

        store.set("/calls", &p, json!("v"), Duration::from_millis(1));
        sleep(Duration::from_millis(2));

        assert_eq!(store.get("/calls", &p), None);
        assert!(store.is_empty(), "expired entry must be purged on read");
        assert_eq!(store.get("/calls", &p), None);
    }

    #[test]
    fn test_store_lru_touch_on_get() {
        let mut store = CacheStore::new(2);
        let p = Params::new();

        store.set("/a", &p, json!("A"), MINUTE);
        store.set("/b", &p, json!("B"), MINUTE);
        assert!(store.get("/a", &p).is_some());
        store.set("/c", &p, json!("C"), MINUTE);

        assert_eq!(store.len(), 2);
        assert!(store.get("/a", &p).is_some());
        assert!(store.get("/b", &p).is_none());
        assert!(store.get("/c", &p).is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_store_lru_eviction_without_touch() {
        let mut store = CacheStore::new(3);
        let p = Params::new();

        for endpoint in ["/k1", "/k2", "/k3", "/k4"] {
            store.set(endpoint, &p, json!(endpoint), MINUTE);
        }

        assert_eq!(store.len(), 3);
        assert!(store.get("/k1", &p).is_none());
        assert!(store.get("/k4", &p).is_some());
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let mut store = CacheStore::new(100);
        store.set("/people", &params(json!({"offset": 0})), json!(1), MINUTE);
        store.set("/people", &params(json!({"offset": 100})), json!(2), MINUTE);
        store.set("/people/42", &Params::new(), json!(3), MINUTE);
        store.set("/deals", &Params::new(), json!(4), MINUTE);

        let removed = store.invalidate(Some("/people"));

        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);
        assert!(store.get("/deals", &Params::new()).is_some());
    }

    #[test]
    fn test_invalidate_resource_respects_path_boundaries() {
        let mut store = CacheStore::new(100);
        store.set("/people", &params(json!({"offset": 0})), json!(1), MINUTE);
        store.set("/people/42", &Params::new(), json!(2), MINUTE);
        store.set("/peopleRelationships", &Params::new(), json!(3), MINUTE);
        store.set("/deals", &params(json!({"personId": "/people"})), json!(4), MINUTE);

        assert_eq!(store.invalidate_resource("/people"), 2);
        assert!(store.get("/peopleRelationships", &Params::new()).is_some());
        assert!(store.get("/deals", &params(json!({"personId": "/people"}))).is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let mut store = CacheStore::new(100);
        store.set("/people", &Params::new(), json!(1), MINUTE);
        store.set("/deals", &Params::new(), json!(2), MINUTE);

        assert_eq!(store.invalidate(None), 2);
        assert!(store.is_empty());
        assert!(store.stats().entries.is_empty());
    }

    #[test]
    fn test_invalidate_no_match() {
        let mut store = CacheStore::new(100);
        store.set("/deals", &Params::new(), json!(1), MINUTE);
        assert_eq!(store.invalidate(Some("/people")), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let mut store = CacheStore::new(100);
        store.set("/calls", &Params::new(), json!(1), Duration::from_millis(1));
        store.set("/users", &Params::new(), json!(2), MINUTE);

        sleep(Duration::from_millis(5));

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("/users", &Params::new()).is_some());
    }

    #[test]
    fn test_disabled_store() {
        let mut store = CacheStore::with_enabled(100, false);
        store.set("/people", &Params::new(), json!(1), MINUTE);

        assert!(store.get("/people", &Params::new()).is_none());
        assert_eq!(store.invalidate(None), 0);
        assert!(!store.stats().enabled);
    }

    #[test]
    fn test_stats_report() {
        let mut store = CacheStore::new(10);
        store.set("/people", &params(json!({"limit": 1})), json!(1), MINUTE);
        store.set("/deals", &Params::new(), json!(2), Duration::from_secs(30));
        store.get("/people", &params(json!({"limit": 1})));

        let report = store.stats();
        assert_eq!(report.size, 2);
        assert_eq!(report.max_size, 10);
        assert_eq!(report.hits, 1);
        assert_eq!(report.entries.len(), 2);
        // the hit promoted /people to most recently used
        assert_eq!(report.entries[1].source, r#"/people:{"limit":1}"#);
        assert_eq!(report.entries[0].ttl_seconds, 30.0);
    }
}
