//! Top-level configuration: the unit the reloader publishes a new generation
//! from. Grounded in `kairos-rs::models::settings::Settings` — a version tag
//! plus a route list — expanded with the transport defaults every route
//! merges against (§4.4).

use crate::models::router::RouteConfig;
use serde::{Deserialize, Serialize};

/// Process-wide defaults for outbound connections, merged under a route's own
/// `transport_ref` override (§4.4's three-level merge: global → named →
/// per-route).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub tcp_nodelay: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// If true, resolved backend addresses are checked against `ssrf_deny_cidrs`
    /// before dialing (§4.4).
    #[serde(default)]
    pub ssrf_filter_enabled: bool,
    #[serde(default)]
    pub ssrf_deny_cidrs: Vec<String>,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_pool_idle_timeout_secs() -> u64 {
    90
}
fn default_pool_max_idle_per_host() -> usize {
    32
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            tcp_nodelay: true,
            accept_invalid_certs: false,
            ssrf_filter_enabled: false,
            ssrf_deny_cidrs: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Field-wise merge: each field of `override_cfg` that differs from the
    /// type default replaces the corresponding field of `self` (§4.4's
    /// defaults ← global ← per-upstream merge).
    pub fn merged_with(&self, override_cfg: &TransportConfig) -> TransportConfig {
        let base = TransportConfig::default();
        TransportConfig {
            connect_timeout_ms: if override_cfg.connect_timeout_ms != base.connect_timeout_ms {
                override_cfg.connect_timeout_ms
            } else {
                self.connect_timeout_ms
            },
            pool_idle_timeout_secs: if override_cfg.pool_idle_timeout_secs != base.pool_idle_timeout_secs {
                override_cfg.pool_idle_timeout_secs
            } else {
                self.pool_idle_timeout_secs
            },
            pool_max_idle_per_host: if override_cfg.pool_max_idle_per_host != base.pool_max_idle_per_host {
                override_cfg.pool_max_idle_per_host
            } else {
                self.pool_max_idle_per_host
            },
            tcp_nodelay: override_cfg.tcp_nodelay || self.tcp_nodelay,
            accept_invalid_certs: override_cfg.accept_invalid_certs || self.accept_invalid_certs,
            ssrf_filter_enabled: override_cfg.ssrf_filter_enabled || self.ssrf_filter_enabled,
            ssrf_deny_cidrs: if !override_cfg.ssrf_deny_cidrs.is_empty() {
                override_cfg.ssrf_deny_cidrs.clone()
            } else {
                self.ssrf_deny_cidrs.clone()
            },
        }
    }
}

/// A named transport override, selectable from a route's `transport_ref`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NamedTransport {
    pub name: String,
    #[serde(flatten)]
    pub config: TransportConfig,
}

/// The configuration generation the reloader compiles into a `HandlerMap` /
/// `ProxyMap` pair (§4.7). Loaded whole from JSON; never mutated in place —
/// a reload always builds and validates a brand new `Config`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Configuration schema version for compatibility checking.
    pub version: u8,

    /// Process-wide transport defaults.
    #[serde(default)]
    pub defaults: TransportConfig,

    /// Named transport overrides a route can select via `transport_ref`.
    #[serde(default)]
    pub transports: Vec<NamedTransport>,

    /// Route definitions, processed in file order; sort order at match time
    /// is governed by [`RouteConfig::path_specificity`] and `priority`, not
    /// this list's order.
    pub routes: Vec<RouteConfig>,
}

impl Config {
    /// Validates every route and checks that `transport_ref` references
    /// resolve, and that route ids are unique (needed for stable HandlerMap
    /// keys across a reload).
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_ids = std::collections::HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !seen_ids.insert(route.id.as_str()) {
                return Err(format!("duplicate route id: {}", route.id));
            }
            if let Some(ref name) = route.transport_ref {
                if !self.transports.iter().any(|t| &t.name == name) {
                    return Err(format!(
                        "route {}: unknown transport_ref {name}",
                        route.id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn transport_for(&self, name: &str) -> Option<&TransportConfig> {
        self.transports.iter().find(|t| t.name == name).map(|t| &t.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{BackendConfig, BackendsRef, BalancerSpec, MatchSpec};

    fn route(id: &str) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            priority: 0,
            match_spec: MatchSpec { methods: vec![], hosts: vec![], path: "/x".into(), header_predicates: vec![], query_predicates: vec![] },
            auth_required: false,
            auth_methods: vec![],
            backends_ref: BackendsRef::Inline { backends: vec![BackendConfig { url: "http://b".into(), weight: 1 }] },
            balancer: BalancerSpec::RoundRobin,
            transport_ref: None,
            retry_policy: Default::default(),
            timeout_policy: Default::default(),
            circuit_breaker: Default::default(),
            adaptive_concurrency: Default::default(),
            mirror: None,
            redirect_policy: Default::default(),
            feature_flags: Default::default(),
        }
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let cfg = Config { version: 1, defaults: Default::default(), transports: vec![], routes: vec![route("r1"), route("r1")] };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_transport_ref() {
        let mut r = route("r1");
        r.transport_ref = Some("missing".into());
        let cfg = Config { version: 1, defaults: Default::default(), transports: vec![], routes: vec![r] };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn merge_overrides_only_changed_fields() {
        let base = TransportConfig::default();
        let override_cfg = TransportConfig { connect_timeout_ms: 1_000, ..TransportConfig::default() };
        let merged = base.merged_with(&override_cfg);
        assert_eq!(merged.connect_timeout_ms, 1_000);
        assert_eq!(merged.pool_idle_timeout_secs, base.pool_idle_timeout_secs);
    }

    #[test]
    fn accepts_clean_config() {
        let cfg = Config { version: 1, defaults: Default::default(), transports: vec![], routes: vec![route("r1")] };
        assert!(cfg.validate().is_ok());
    }
}
