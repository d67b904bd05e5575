//! Service discovery: the external interface a `BackendsRef::Discovery`
//! route resolves through (§6). New module — the teacher has no discovery
//! abstraction at all, resolving every route from inline config. Only the
//! trait and an in-memory test double are in scope; concrete registry
//! backends (Consul, k8s, DNS-SD) are explicit non-goals.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::router::BackendConfig;

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn resolve(&self, service: &str, tags: &[String]) -> Vec<BackendConfig>;
}

/// A fixed in-memory registry, for tests and for exercising discovery-backed
/// routes without a real registry dependency.
#[derive(Default)]
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, Vec<BackendConfig>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: &str, backends: Vec<BackendConfig>) {
        self.services.write().unwrap().insert(service.to_string(), backends);
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, service: &str, _tags: &[String]) -> Vec<BackendConfig> {
        self.services.read().unwrap().get(service).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_service() {
        let discovery = StaticDiscovery::new();
        discovery.register("users", vec![BackendConfig { url: "http://u1".into(), weight: 1 }]);
        let backends = discovery.resolve("users", &[]).await;
        assert_eq!(backends.len(), 1);
    }

    #[tokio::test]
    async fn unknown_service_resolves_empty() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.resolve("missing", &[]).await.is_empty());
    }
}
