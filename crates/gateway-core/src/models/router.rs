//! Route configuration: the declarative shape of a single gateway route.
//!
//! A [`RouteConfig`] is the serde-deserialized, on-disk representation of a
//! route. It is compiled by [`crate::utils::route_table::RouteTable`] and
//! turned into runtime resources (balancer, transport, proxy, middleware
//! chain) by the reloader. `RouteConfig` itself never changes once a config
//! generation has been built from it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Load balancing policy for a route's backend set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case", tag = "policy", content = "params")]
pub enum BalancerSpec {
    #[default]
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    ConsistentHash {
        #[serde(default = "default_replicas")]
        replicas: u32,
        #[serde(default)]
        key: HashKeySource,
    },
    SessionAffinity {
        #[serde(default = "default_affinity_ttl")]
        ttl_seconds: u64,
        #[serde(default)]
        cookie_name: Option<String>,
        inner: Box<BalancerSpec>,
    },
    WeightedGroups {
        groups: Vec<WeightedGroup>,
        #[serde(default)]
        sticky: Option<StickySpec>,
    },
}

fn default_replicas() -> u32 {
    160
}

fn default_affinity_ttl() -> u64 {
    60
}

/// Source of the key consistent-hashing hashes on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashKeySource {
    #[default]
    RemoteAddr,
    Path,
    Header(String),
    Cookie(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeightedGroup {
    pub name: String,
    pub weight: u32,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub policy: Box<BalancerSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StickySpec {
    #[serde(default)]
    pub cookie_name: Option<String>,
    #[serde(default)]
    pub header_name: Option<String>,
}

/// A single upstream endpoint as configured (before runtime health state is
/// attached by [`crate::services::backend::Backend`]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Where a route's backends come from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackendsRef {
    Inline { backends: Vec<BackendConfig> },
    Upstream { name: String },
    Discovery { service: String, #[serde(default)] tags: Vec<String> },
}

/// A set over `{network_error, timeout, idempotent_5xx, specific_status_codes}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RetryConditions {
    #[serde(default)]
    pub network_error: bool,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub idempotent_5xx: bool,
    #[serde(default)]
    pub specific_status_codes: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub retry_conditions: RetryConditions,
    /// Allow retrying POST when an explicit opt-in is set (normally POST only
    /// retries with an `Idempotency-Key` header present on the request).
    #[serde(default)]
    pub retry_post: bool,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_base_ms() -> u64 {
    50
}
fn default_backoff_cap_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: true,
            retry_conditions: RetryConditions::default(),
            retry_post: false,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = self.backoff_base_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.backoff_cap_ms);
        let delay = if self.jitter {
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..=capped.max(1))
        } else {
            capped
        };
        std::time::Duration::from_millis(delay)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    #[serde(default = "default_timeout_ms")]
    pub per_attempt_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { per_attempt_ms: default_timeout_ms() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CircuitBreakerSpec {
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_min_volume")]
    pub min_volume: u32,
    #[serde(default = "default_window")]
    pub window_size: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    /// If true, one breaker per backend URL; otherwise one breaker per route.
    #[serde(default = "default_true")]
    pub per_backend: bool,
}

fn default_failure_ratio() -> f64 {
    0.5
}
fn default_min_volume() -> u32 {
    10
}
fn default_window() -> u32 {
    20
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_half_open_probes() -> u32 {
    1
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            min_volume: default_min_volume(),
            window_size: default_window(),
            cooldown_ms: default_cooldown_ms(),
            half_open_probes: default_half_open_probes(),
            per_backend: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AdaptiveConcurrencySpec {
    pub enabled: bool,
    #[serde(default = "default_initial_limit")]
    pub initial_limit: u32,
    #[serde(default = "default_min_limit")]
    pub min_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,
}

fn default_initial_limit() -> u32 {
    20
}
fn default_min_limit() -> u32 {
    4
}
fn default_max_limit() -> u32 {
    1_000
}
fn default_target_latency_ms() -> u64 {
    250
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MirrorSpec {
    pub backends: Vec<BackendConfig>,
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,
}

fn default_sample_fraction() -> f64 {
    1.0
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RedirectPolicy {
    pub follow: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default)]
    pub same_origin_only: bool,
}

fn default_max_redirects() -> u32 {
    5
}

/// Which middleware stages this route activates, keyed by canonical stage
/// name (see [`crate::middleware::chain::CANONICAL_STAGES`]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FeatureFlags {
    #[serde(default)]
    pub enabled_stages: HashSet<String>,
    #[serde(default)]
    pub rate_limit: Option<crate::middleware::rate_limit::RateLimitSpec>,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub body_size_limit_bytes: Option<usize>,
}

/// A match predicate over request headers or query parameters: the named
/// field must be present and, if `value` is set, equal to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MatchSpec {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub path: String,
    #[serde(default)]
    pub header_predicates: Vec<FieldPredicate>,
    #[serde(default)]
    pub query_predicates: Vec<FieldPredicate>,
}

/// Immutable, fully-specified route. One `RouteConfig` compiles to one
/// entry in the [`crate::utils::route_table::RouteTable`] and, through the
/// reloader, one handler + one [`crate::services::route_proxy::RouteProxy`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub auth_methods: Vec<String>,
    pub backends_ref: BackendsRef,
    #[serde(default)]
    pub balancer: BalancerSpec,
    #[serde(default)]
    pub transport_ref: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSpec,
    #[serde(default)]
    pub adaptive_concurrency: AdaptiveConcurrencySpec,
    #[serde(default)]
    pub mirror: Option<MirrorSpec>,
    #[serde(default)]
    pub redirect_policy: RedirectPolicy,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

impl RouteConfig {
    /// Count of literal path segments minus capture segments; higher wins
    /// ties at the same priority (§4.1).
    pub fn path_specificity(&self) -> i64 {
        let mut literal = 0i64;
        let mut captures = 0i64;
        for seg in self.match_spec.path.split('/') {
            if seg.is_empty() {
                continue;
            }
            if seg.starts_with('{') || seg == "*" {
                captures += 1;
            } else {
                literal += 1;
            }
        }
        literal - captures
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("route id must not be empty".into());
        }
        if !self.match_spec.path.starts_with('/') {
            return Err(format!("route {}: path must start with '/'", self.id));
        }
        let valid_methods = [
            "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
        ];
        for m in &self.match_spec.methods {
            if !valid_methods.contains(&m.as_str()) {
                return Err(format!("route {}: invalid HTTP method {m}", self.id));
            }
        }
        match &self.backends_ref {
            BackendsRef::Inline { backends } => {
                if backends.is_empty() {
                    return Err(format!("route {}: at least one backend required", self.id));
                }
                for b in backends {
                    if !b.url.starts_with("http://") && !b.url.starts_with("https://") {
                        return Err(format!(
                            "route {}: backend url must start with http:// or https://: {}",
                            self.id, b.url
                        ));
                    }
                    if b.weight == 0 {
                        return Err(format!("route {}: backend weight must be > 0", self.id));
                    }
                }
            }
            BackendsRef::Upstream { name } if name.is_empty() => {
                return Err(format!("route {}: upstream reference name is empty", self.id));
            }
            BackendsRef::Discovery { service, .. } if service.is_empty() => {
                return Err(format!("route {}: discovery service name is empty", self.id));
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_route() -> RouteConfig {
        RouteConfig {
            id: "r1".into(),
            priority: 0,
            match_spec: MatchSpec {
                methods: vec!["GET".into()],
                hosts: vec![],
                path: "/users/{id}".into(),
                header_predicates: vec![],
                query_predicates: vec![],
            },
            auth_required: false,
            auth_methods: vec![],
            backends_ref: BackendsRef::Inline {
                backends: vec![BackendConfig { url: "http://b1".into(), weight: 1 }],
            },
            balancer: BalancerSpec::RoundRobin,
            transport_ref: None,
            retry_policy: RetryPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            circuit_breaker: CircuitBreakerSpec::default(),
            adaptive_concurrency: AdaptiveConcurrencySpec::default(),
            mirror: None,
            redirect_policy: RedirectPolicy::default(),
            feature_flags: FeatureFlags::default(),
        }
    }

    #[test]
    fn validates_clean_route() {
        assert!(base_route().validate().is_ok());
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let mut r = base_route();
        r.match_spec.path = "users/{id}".into();
        assert!(r.validate().is_err());
    }

    #[test]
    fn path_specificity_prefers_literal_segments() {
        let mut literal = base_route();
        literal.match_spec.path = "/users/active".into();
        let mut dynamic = base_route();
        dynamic.match_spec.path = "/users/{id}".into();
        assert!(literal.path_specificity() > dynamic.path_specificity());
    }

    #[test]
    fn rejects_empty_inline_backends() {
        let mut r = base_route();
        r.backends_ref = BackendsRef::Inline { backends: vec![] };
        assert!(r.validate().is_err());
    }
}
