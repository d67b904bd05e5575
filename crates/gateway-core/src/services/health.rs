//! Health checking: the external interface a reloader's background task
//! polls to keep a [`crate::services::backend::Backend`]'s health flag
//! current (§6). New module — the teacher updates health implicitly from
//! request outcomes only, with no active probing; this adds the interface
//! spec.md §6 names plus an in-memory test double, leaving concrete HTTP/TCP
//! probing as future wiring (out of scope here: no admin surface to expose
//! check results).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, backend_url: &str) -> bool;
}

/// A checker whose per-backend answer is set directly, for tests.
#[derive(Default)]
pub struct StaticHealthChecker {
    state: RwLock<HashMap<String, bool>>,
}

impl StaticHealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, backend_url: &str, healthy: bool) {
        self.state.write().unwrap().insert(backend_url.to_string(), healthy);
    }
}

#[async_trait]
impl HealthChecker for StaticHealthChecker {
    async fn check(&self, backend_url: &str) -> bool {
        self.state.read().unwrap().get(backend_url).copied().unwrap_or(true)
    }
}

/// Polls every backend in `balancer` via `checker` once, marking each
/// healthy/unhealthy accordingly. The reloader schedules this on an
/// interval per route.
pub async fn run_health_sweep(balancer: &dyn crate::services::load_balancer::Balancer, checker: &dyn HealthChecker) {
    for backend in balancer.backends() {
        if checker.check(&backend.url).await {
            backend.mark_healthy();
        } else {
            backend.mark_unhealthy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::Backend;
    use crate::services::load_balancer::RoundRobinBalancer;

    #[tokio::test]
    async fn sweep_marks_backend_unhealthy_per_checker() {
        let backend = Backend::new("http://b1".into(), 1);
        let balancer = RoundRobinBalancer::new(vec![backend.clone()]);
        let checker = StaticHealthChecker::new();
        checker.set("http://b1", false);
        run_health_sweep(&balancer, &checker).await;
        assert!(!backend.is_healthy());
    }

    #[tokio::test]
    async fn unseen_backend_defaults_healthy() {
        let checker = StaticHealthChecker::new();
        assert!(checker.check("http://unknown").await);
    }
}
