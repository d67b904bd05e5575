//! Reloader: compiles a [`Config`] into an atomically-published generation
//! of route table + handlers (§4.7).
//!
//! Generalizes `kairos-rs::config::hot_reload::ConfigWatcher`, which polled a
//! file and broadcast a new `Settings` over a `tokio::sync::broadcast`
//! channel with readers holding a `tokio::sync::RwLock` snapshot. This keeps
//! the poll-and-republish shape but swaps the `RwLock` for a lock-free
//! `arc_swap::ArcSwap`, the "atomic pointer with acquire/release ordering"
//! §9's design notes call for — grounded in `agentgateway`'s use of
//! `ArcSwapOption` for live-swapped shared client state.

use crate::middleware::chain::{build_chain, ExtensionSpec, Handler};
use crate::middleware::rate_limit::RateLimitStore;
use crate::models::router::BackendsRef;
use crate::models::settings::Config;
use crate::services::backend::Backend;
use crate::services::load_balancer::build_balancer;
use crate::services::route_proxy::{ProxyRequest, RouteProxy};
use crate::services::transport::TransportPool;
use crate::utils::route_table::RouteTable;
use arc_swap::ArcSwap;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// One atomically-swappable generation: the route table readers match
/// against, plus the composed handler for each route id it contains
/// (together, the teacher's `HandlerMap`/`ProxyMap` pair from §4.7).
pub struct Generation {
    pub table: RouteTable,
    pub handlers: HashMap<String, Handler>,
}

pub struct Reloader {
    current: ArcSwap<Generation>,
    transport_pool: ArcSwap<TransportPool>,
    rate_limit_store: Arc<RateLimitStore>,
    extensions: Vec<ExtensionSpec>,
}

impl Reloader {
    /// Builds the first generation from `config`, failing the whole startup
    /// if it doesn't validate or compile — a reload failure after this point
    /// never takes the process down (§4.7: the previous generation keeps
    /// serving).
    pub fn new(config: &Config) -> Result<Self, String> {
        Self::with_extensions(config, Vec::new())
    }

    /// Like [`Self::new`], but splices `extensions` into every route's chain
    /// (§4.2 anchor insertion). Extensions are fixed for the lifetime of the
    /// `Reloader`; they apply to every subsequent [`Self::reload`] too.
    pub fn with_extensions(config: &Config, extensions: Vec<ExtensionSpec>) -> Result<Self, String> {
        let rate_limit_store = Arc::new(RateLimitStore::new());
        let transport_pool = Arc::new(build_transport_pool(config)?);
        let generation = build_generation(config, transport_pool.clone(), &rate_limit_store, &extensions)?;
        Ok(Self {
            current: ArcSwap::from_pointee(generation),
            transport_pool: ArcSwap::from(transport_pool),
            rate_limit_store,
            extensions,
        })
    }

    pub fn current(&self) -> arc_swap::Guard<Arc<Generation>> {
        self.current.load()
    }

    /// Compiles `config` into a new generation and publishes it atomically.
    /// On failure, the previous generation is left untouched and serving.
    pub fn reload(&self, config: &Config) -> Result<(), String> {
        let transport_pool = Arc::new(build_transport_pool(config)?);
        let generation = build_generation(config, transport_pool.clone(), &self.rate_limit_store, &self.extensions)?;
        self.transport_pool.store(transport_pool);
        self.current.store(Arc::new(generation));
        Ok(())
    }
}

fn build_transport_pool(config: &Config) -> Result<TransportPool, String> {
    let overrides: Vec<(String, crate::models::settings::TransportConfig)> =
        config.transports.iter().map(|t| (t.name.clone(), config.defaults.merged_with(&t.config))).collect();
    TransportPool::new(config.defaults.clone(), &overrides).map_err(|e| e.to_string())
}

fn build_generation(
    config: &Config,
    transport_pool: Arc<TransportPool>,
    rate_limit_store: &Arc<RateLimitStore>,
    extensions: &[ExtensionSpec],
) -> Result<Generation, String> {
    config.validate()?;

    let mut handlers = HashMap::new();
    let mut routes = Vec::new();

    for route_cfg in &config.routes {
        let route = Arc::new(route_cfg.clone());

        let backends: Vec<Arc<Backend>> = match &route.backends_ref {
            BackendsRef::Inline { backends } => backends.iter().map(|b| Backend::new(b.url.clone(), b.weight)).collect(),
            BackendsRef::Upstream { name } => {
                warn!("route {}: upstream reference {name} requires a registered upstream, skipping route (out of scope)", route.id);
                continue;
            }
            BackendsRef::Discovery { service, .. } => {
                warn!("route {}: discovery service {service} requires a live ServiceDiscovery, skipping route (out of scope)", route.id);
                continue;
            }
        };

        let balancer = build_balancer(&route.balancer, backends);
        let mirror_balancer = route.mirror.as_ref().map(|mirror| {
            let mirror_backends: Vec<Arc<Backend>> = mirror.backends.iter().map(|b| Backend::new(b.url.clone(), b.weight)).collect();
            build_balancer(&crate::models::router::BalancerSpec::RoundRobin, mirror_backends)
        });

        let proxy = Arc::new(RouteProxy::new(route.clone(), balancer, mirror_balancer, transport_pool.clone()));
        let inner: Handler = Arc::new(move |_ctx, req: ProxyRequest| {
            let proxy = proxy.clone();
            Box::pin(async move { proxy.proxy(&req).await })
        });

        let handler = build_chain(&route, rate_limit_store, extensions, inner);
        handlers.insert(route.id.clone(), handler);
        routes.push(route_cfg.clone());
    }

    let table = RouteTable::new(routes).map_err(|e| e.to_string())?;
    Ok(Generation { table, handlers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{BackendConfig, BackendsRef, BalancerSpec, FeatureFlags, MatchSpec, RouteConfig};

    fn config() -> Config {
        Config {
            version: 1,
            defaults: Default::default(),
            transports: vec![],
            routes: vec![RouteConfig {
                id: "r1".into(),
                priority: 0,
                match_spec: MatchSpec { methods: vec![], hosts: vec![], path: "/x".into(), header_predicates: vec![], query_predicates: vec![] },
                auth_required: false,
                auth_methods: vec![],
                backends_ref: BackendsRef::Inline { backends: vec![BackendConfig { url: "http://127.0.0.1:1".into(), weight: 1 }] },
                balancer: BalancerSpec::RoundRobin,
                transport_ref: None,
                retry_policy: Default::default(),
                timeout_policy: Default::default(),
                circuit_breaker: Default::default(),
                adaptive_concurrency: Default::default(),
                mirror: None,
                redirect_policy: Default::default(),
                feature_flags: FeatureFlags::default(),
            }],
        }
    }

    #[test]
    fn builds_initial_generation_with_handler_per_route() {
        let reloader = Reloader::new(&config()).unwrap();
        let generation = reloader.current();
        assert!(generation.handlers.contains_key("r1"));
        assert!(generation.table.find_match("GET", None, "/x", &[], &[]).is_some());
    }

    #[test]
    fn upstream_backed_route_is_skipped_not_fatal() {
        let mut cfg = config();
        cfg.routes[0].backends_ref = BackendsRef::Upstream { name: "svc".into() };
        let reloader = Reloader::new(&cfg).unwrap();
        assert!(reloader.current().handlers.is_empty());
    }

    #[test]
    fn reload_replaces_generation_atomically() {
        let reloader = Reloader::new(&config()).unwrap();
        let mut cfg2 = config();
        cfg2.routes[0].id = "r2".into();
        reloader.reload(&cfg2).unwrap();
        assert!(reloader.current().handlers.contains_key("r2"));
        assert!(!reloader.current().handlers.contains_key("r1"));
    }

    #[test]
    fn invalid_reload_leaves_previous_generation_serving() {
        let reloader = Reloader::new(&config()).unwrap();
        let mut bad = config();
        bad.routes.push(bad.routes[0].clone());
        assert!(reloader.reload(&bad).is_err());
        assert!(reloader.current().handlers.contains_key("r1"));
    }
}
