//! Runtime backend: a configured upstream URL plus the atomic health and
//! load counters the Balancer and RouteProxy read and update on the hot
//! path. Generalizes `kairos-rs::models::router::Backend`, which carried
//! only `{host, port, weight, health_check_path}` with no runtime state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A single upstream endpoint with lock-free health/load counters, shared
/// via `Arc` between the Balancer's backend view and the RouteProxy.
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    pub weight: u32,
    healthy: AtomicBool,
    in_flight: AtomicU64,
    /// Latency EWMA in microseconds, fixed-point (×1000) for lock-free CAS.
    latency_ewma_us: AtomicU64,
}

const EWMA_ALPHA_NUM: u64 = 2;
const EWMA_ALPHA_DEN: u64 = 10;

impl Backend {
    pub fn new(url: String, weight: u32) -> Arc<Self> {
        Arc::new(Self {
            url,
            weight,
            healthy: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            latency_ewma_us: AtomicU64::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn latency_ewma_us(&self) -> u64 {
        self.latency_ewma_us.load(Ordering::Relaxed)
    }

    /// Updates the latency EWMA with a freshly observed sample, via CAS loop
    /// so concurrent observers never tear the update.
    pub fn record_latency(&self, sample_us: u64) {
        let mut current = self.latency_ewma_us.load(Ordering::Relaxed);
        loop {
            let next = if current == 0 {
                sample_us
            } else {
                (current * (EWMA_ALPHA_DEN - EWMA_ALPHA_NUM) + sample_us * EWMA_ALPHA_NUM) / EWMA_ALPHA_DEN
            };
            match self.latency_ewma_us.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy_with_zero_in_flight() {
        let b = Backend::new("http://b".into(), 1);
        assert!(b.is_healthy());
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn in_flight_tracks_begin_end() {
        let b = Backend::new("http://b".into(), 1);
        b.begin_request();
        b.begin_request();
        assert_eq!(b.in_flight(), 2);
        b.end_request();
        assert_eq!(b.in_flight(), 1);
    }

    #[test]
    fn latency_ewma_converges_toward_samples() {
        let b = Backend::new("http://b".into(), 1);
        b.record_latency(100);
        assert_eq!(b.latency_ewma_us(), 100);
        for _ in 0..50 {
            b.record_latency(200);
        }
        assert!(b.latency_ewma_us() > 150);
    }

    #[test]
    fn mark_unhealthy_then_healthy() {
        let b = Backend::new("http://b".into(), 1);
        b.mark_unhealthy();
        assert!(!b.is_healthy());
        b.mark_healthy();
        assert!(b.is_healthy());
    }
}
