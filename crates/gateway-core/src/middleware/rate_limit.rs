//! Rate limiting for the `rate_limit` control-phase stage (§4.2 phase 3).
//!
//! Generalizes `kairos-rs::middleware::rate_limit`'s `RateLimitConfig`/
//! `RateLimitStore` pair: keeps the per-key in-memory store with lazy
//! cleanup, narrowed from the teacher's five strategies/three window
//! algorithms down to a single token-bucket keyed by client IP (the
//! strategy every other kind reduces to once a key is chosen), since that is
//! what `RouteConfig::feature_flags::rate_limit` actually needs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Per-route rate limit configuration, referenced from
/// [`crate::models::router::FeatureFlags::rate_limit`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSpec {
    /// Sustained requests per second.
    pub requests_per_second: f64,
    /// Extra requests allowed in a burst above the sustained rate.
    pub burst: u64,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self { requests_per_second: 10.0, burst: 20 }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory token-bucket store keyed by client identity (remote address by
/// default). One bucket per key; unseen keys start full.
pub struct RateLimitStore {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self { buckets: RwLock::new(HashMap::new()) }
    }

    /// Attempts to consume one token for `key` under `spec`. Returns `true`
    /// if the request is admitted.
    pub fn check(&self, key: &str, spec: &RateLimitSpec) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap();
        let capacity = spec.requests_per_second + spec.burst as f64;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket { tokens: capacity, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * spec.requests_per_second).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets untouched for longer than `max_age`, called periodically
    /// by the reloader to bound memory.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets.write().unwrap().retain(|_, b| now.duration_since(b.last_refill) < max_age);
    }
}
