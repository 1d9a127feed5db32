//! TTL Policy Module
//!
//! Chooses how long a response may be served from cache, based on how often
//! the underlying resource type changes.

use std::time::Duration;

// == TTL Policy ==
/// Endpoint-to-TTL table with exact, longest-prefix and default resolution.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    rules: Vec<(String, Duration)>,
    default_ttl: Duration,
}

impl TtlPolicy {
    /// Creates an empty table that always answers `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            default_ttl,
        }
    }

    /// Adds (or replaces) the TTL for an endpoint name or prefix.
    pub fn with_rule(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        let prefix = prefix.into();
        self.rules.retain(|(existing, _)| *existing != prefix);
        self.rules.push((prefix, ttl));
        self
    }

    /// The CRM resource table: configuration-like resources live longest,
    /// activity logs the shortest.
    pub fn standard(default_ttl: Duration) -> Self {
        let slow = Duration::from_secs(300);
        let medium = Duration::from_secs(60);
        let fast = Duration::from_secs(30);

        Self::new(default_ttl)
            .with_rule("/customFields", slow)
            .with_rule("/pipelines", slow)
            .with_rule("/stages", slow)
            .with_rule("/users", slow)
            .with_rule("/people", medium)
            .with_rule("/deals", medium)
            .with_rule("/tasks", medium)
            .with_rule("/calls", fast)
            .with_rule("/events", fast)
            .with_rule("/notes", fast)
            .with_rule("/appointments", fast)
    }

    // == TTL For ==
    /// Resolves the TTL for `endpoint`.
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        if let Some((_, ttl)) = self.rules.iter().find(|(name, _)| name == endpoint) {
            return *ttl;
        }

        self.rules
            .iter()
            .filter(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::standard(Duration::from_secs(60))
    }
}
