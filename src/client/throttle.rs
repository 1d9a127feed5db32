//! Request Throttling
//!
//! Back-pressure against the remote rate limiter: one serialized gate with a
//! fixed delay per physical request, plus quota-driven extra waits.

use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;

use crate::config::Config;

/// Header carrying the remaining request quota.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Below this remaining quota the long extra delay applies.
pub const LOW_QUOTA: u64 = 10;

/// Below this remaining quota the short extra delay applies.
pub const MODERATE_QUOTA: u64 = 50;

// == Throttle ==
/// Delay settings for the fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Throttle {
    /// Unconditional wait before every physical request
    pub request_delay: Duration,
    /// Extra wait when the remaining quota drops below [`LOW_QUOTA`]
    pub low_quota_delay: Duration,
    /// Extra wait when the remaining quota drops below [`MODERATE_QUOTA`]
    pub moderate_quota_delay: Duration,
    /// Wait after a 429 before the error is surfaced
    pub rate_limit_cooldown: Duration,
}

impl Throttle {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_delay: Duration::from_millis(config.rate_limit_delay_ms),
            ..Self::default()
        }
    }

    /// No waiting at all.
    pub fn none() -> Self {
        Self {
            request_delay: Duration::ZERO,
            low_quota_delay: Duration::ZERO,
            moderate_quota_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
        }
    }

    /// Extra wait owed for the given remaining quota.
    pub fn quota_delay(&self, remaining: u64) -> Option<Duration> {
        if remaining < LOW_QUOTA {
            Some(self.low_quota_delay)
        } else if remaining < MODERATE_QUOTA {
            Some(self.moderate_quota_delay)
        } else {
            None
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(50),
            low_quota_delay: Duration::from_millis(200),
            moderate_quota_delay: Duration::from_millis(100),
            rate_limit_cooldown: Duration::from_secs(2),
        }
    }
}

/// Reads the remaining quota header; absent or malformed means unknown.
pub fn remaining_quota(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

// == Rate Gate ==
/// Serialized admission point shared by every fetch task.
///
/// The lock is held for the whole delay, so concurrent callers are spaced
/// at least `delay` apart.
#[derive(Debug)]
pub struct RateGate {
    lock: Mutex<()>,
    delay: Duration,
}

impl RateGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            delay,
        }
    }

    /// Waits for this caller's turn.
    pub async fn pass(&self) {
        let _turn = self.lock.lock().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}
