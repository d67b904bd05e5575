//! Adaptive concurrency limiting for the `adaptive_concurrency` resilience
//! stage (§4.2 phase 6, spec body §"Adaptive concurrency"). New module — no
//! teacher counterpart; grounded in the same atomic-counter style as
//! [`crate::services::backend::Backend`]'s in-flight tracking, with an
//! AIMD update rule: below target latency, increase the limit additively;
//! above it, decrease multiplicatively.

use crate::models::router::AdaptiveConcurrencySpec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct AdaptiveLimiter {
    spec: AdaptiveConcurrencySpec,
    limit: AtomicU32,
    in_flight: AtomicU32,
    last_latency_us: AtomicU64,
}

/// An admitted request's permit; dropping it (or calling [`Self::release`]
/// explicitly after observing latency) decrements in-flight.
pub struct Permit<'a> {
    limiter: &'a AdaptiveLimiter,
    released: bool,
}

impl<'a> Permit<'a> {
    pub fn release(mut self, observed_latency_us: u64) {
        self.limiter.record(observed_latency_us);
        self.released = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl AdaptiveLimiter {
    pub fn new(spec: AdaptiveConcurrencySpec) -> Self {
        let initial = spec.initial_limit;
        Self { spec, limit: AtomicU32::new(initial), in_flight: AtomicU32::new(0), last_latency_us: AtomicU64::new(0) }
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Tries to admit one more request. Returns `None` (reject with 503)
    /// when at the current limit. Disabled limiters always admit.
    pub fn try_admit(&self) -> Option<Permit<'_>> {
        if !self.spec.enabled {
            return Some(Permit { limiter: self, released: true });
        }
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if current >= self.limit() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Permit { limiter: self, released: false })
    }

    /// Records an observed request latency and adjusts the limit (AIMD):
    /// additive increase below target, multiplicative decrease above it.
    fn record(&self, latency_us: u64) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.last_latency_us.store(latency_us, Ordering::Relaxed);
        let target_us = self.spec.target_latency_ms * 1_000;
        let mut current = self.limit.load(Ordering::Relaxed);
        loop {
            let next = if latency_us <= target_us {
                (current + 1).min(self.spec.max_limit)
            } else {
                ((current as f64 * 0.9) as u32).max(self.spec.min_limit)
            };
            match self.limit.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> AdaptiveConcurrencySpec {
        AdaptiveConcurrencySpec { enabled: true, initial_limit: 2, min_limit: 1, max_limit: 10, target_latency_ms: 100 }
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = AdaptiveLimiter::new(AdaptiveConcurrencySpec { enabled: false, ..spec() });
        let _p1 = limiter.try_admit().unwrap();
        let _p2 = limiter.try_admit().unwrap();
        let _p3 = limiter.try_admit().unwrap();
    }

    #[test]
    fn rejects_once_limit_reached() {
        let limiter = AdaptiveLimiter::new(spec());
        let _p1 = limiter.try_admit().unwrap();
        let _p2 = limiter.try_admit().unwrap();
        assert!(limiter.try_admit().is_none());
    }

    #[test]
    fn fast_response_increases_limit() {
        let limiter = AdaptiveLimiter::new(spec());
        let p = limiter.try_admit().unwrap();
        p.release(10_000);
        assert_eq!(limiter.limit(), 3);
    }

    #[test]
    fn slow_response_decreases_limit() {
        let limiter = AdaptiveLimiter::new(AdaptiveConcurrencySpec { initial_limit: 10, ..spec() });
        let p = limiter.try_admit().unwrap();
        p.release(500_000);
        assert!(limiter.limit() < 10);
        assert!(limiter.limit() >= limiter.spec.min_limit);
    }

    #[test]
    fn dropping_permit_without_release_still_frees_slot() {
        let limiter = AdaptiveLimiter::new(spec());
        {
            let _p = limiter.try_admit().unwrap();
            assert_eq!(limiter.in_flight(), 1);
        }
        assert_eq!(limiter.in_flight(), 0);
    }
}
