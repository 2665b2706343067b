//! Best-effort abuse guard for anonymous and download endpoints.
//!
//! Counters live in this process only.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Sliding-log limiter: at most `limit` hits per key in any `window`.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    max_keys: usize,
    clock: Arc<dyn Clock>,
    hits: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: config.requests as usize,
            window: Duration::seconds(i64::try_from(config.window_secs).unwrap_or(i64::MAX / 1000)),
            max_keys: config.max_tracked_keys,
            clock,
            hits: DashMap::new(),
        }
    }

    /// Records a hit for `key`, or reports how long until one would be allowed.
    pub fn check(&self, key: &str) -> Result<()> {
        let now = self.clock.now();
        let cutoff = now - self.window;

        if self.hits.len() >= self.max_keys && !self.hits.contains_key(key) {
            self.evict_expired(cutoff);
        }

        let mut log = self.hits.entry(key.to_string()).or_default();
        while log.front().is_some_and(|t| *t <= cutoff) {
            log.pop_front();
        }

        if log.len() >= self.limit {
            let oldest = log.front().copied().unwrap_or(now);
            let wait_ms = (oldest + self.window - now).num_milliseconds().max(0);
            let retry_after_secs = u64::try_from((wait_ms + 999) / 1000).unwrap_or(1).max(1);
            tracing::debug!(key, retry_after_secs, "rate limit exceeded");
            return Err(Error::RateLimited { retry_after_secs });
        }

        log.push_back(now);
        Ok(())
    }

    /// Drops keys whose newest hit has left the window. Live windows are kept
    /// even when the map stays above its bound.
    fn evict_expired(&self, cutoff: DateTime<Utc>) {
        let before = self.hits.len();
        self.hits
            .retain(|_, log| log.back().is_some_and(|t| *t > cutoff));
        tracing::debug!(evicted = before - self.hits.len(), "evicted expired rate limit windows");
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}
