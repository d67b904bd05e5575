//! Load balancing: selects a backend for a matched route (§4.3).
//!
//! Generalizes `kairos-rs::services::load_balancer::LoadBalancer` and its
//! `RoundRobinBalancer`/`LeastConnectionsBalancer`. Adds `ConsistentHash`,
//! `WeightedGroups`, `SessionAffinity`, and `LeastResponseTime` policies;
//! drops the teacher's `RandomBalancer` and plain `WeightedBalancer` (no
//! counterpart in the policy list) at the final trim.

use crate::models::router::{BalancerSpec, HashKeySource, StickySpec, WeightedGroup};
use crate::services::backend::Backend;
use arc_swap::ArcSwap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Request-derived inputs a policy may key selection on.
pub struct SelectionContext<'a> {
    pub remote_addr: Option<&'a str>,
    pub path: &'a str,
    pub headers: &'a [(String, String)],
    pub cookies: &'a [(String, String)],
}

impl<'a> SelectionContext<'a> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

/// A cookie the session-affinity or sticky-group policy asks the response
/// phase to set (§4.2 phase 7: "session-affinity cookie set").
#[derive(Debug, Clone)]
pub struct AffinityCookie {
    pub name: String,
    pub value: String,
    pub max_age_secs: u64,
}

pub struct Selection {
    pub backend: Arc<Backend>,
    pub set_cookie: Option<AffinityCookie>,
}

impl Selection {
    fn plain(backend: Arc<Backend>) -> Self {
        Self { backend, set_cookie: None }
    }
}

/// `next(ctx) → Option<Backend>`. `update_backends` atomically swaps the
/// view readers hold; `mark_healthy`/`mark_unhealthy` are invoked only by
/// the HealthChecker.
pub trait Balancer: Send + Sync {
    fn next(&self, ctx: &SelectionContext) -> Option<Selection>;
    fn update_backends(&self, backends: Vec<Arc<Backend>>);
    fn backends(&self) -> Vec<Arc<Backend>>;

    fn mark_healthy(&self, url: &str) {
        for b in self.backends() {
            if b.url == url {
                b.mark_healthy();
            }
        }
    }

    fn mark_unhealthy(&self, url: &str) {
        for b in self.backends() {
            if b.url == url {
                b.mark_unhealthy();
            }
        }
    }
}

fn healthy(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    backends.iter().filter(|b| b.is_healthy()).cloned().collect()
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// `healthy[(counter.fetch_add(1)) mod healthy_count]`.
pub struct RoundRobinBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends: ArcSwap::from_pointee(backends), counter: AtomicUsize::new(0) }
    }
}

impl Balancer for RoundRobinBalancer {
    fn next(&self, _ctx: &SelectionContext) -> Option<Selection> {
        let healthy = healthy(&self.backends.load());
        if healthy.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Selection::plain(healthy[idx].clone()))
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        self.backends.store(Arc::new(backends));
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        (**self.backends.load()).clone()
    }
}

/// Linear scan of healthy backends for min `in_flight`; ties prefer higher
/// `weight`, then stable (first-seen) order.
pub struct LeastConnectionsBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
}

impl LeastConnectionsBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends: ArcSwap::from_pointee(backends) }
    }
}

impl Balancer for LeastConnectionsBalancer {
    fn next(&self, _ctx: &SelectionContext) -> Option<Selection> {
        let healthy = healthy(&self.backends.load());
        healthy
            .into_iter()
            .min_by_key(|b| (b.in_flight(), std::cmp::Reverse(b.weight)))
            .map(Selection::plain)
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        self.backends.store(Arc::new(backends));
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        (**self.backends.load()).clone()
    }
}

/// Min-EWMA latency among healthy backends.
pub struct LeastResponseTimeBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
}

impl LeastResponseTimeBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends: ArcSwap::from_pointee(backends) }
    }
}

impl Balancer for LeastResponseTimeBalancer {
    fn next(&self, _ctx: &SelectionContext) -> Option<Selection> {
        let healthy = healthy(&self.backends.load());
        healthy.into_iter().min_by_key(|b| b.latency_ewma_us()).map(Selection::plain)
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        self.backends.store(Arc::new(backends));
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        (**self.backends.load()).clone()
    }
}

struct RingEntry {
    hash: u64,
    backend_idx: usize,
}

/// A ring of `(virtual_node_hash → backend)` with `replicas` virtual nodes
/// per backend, rebuilt on every `update_backends`.
pub struct ConsistentHashBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    ring: ArcSwap<Vec<RingEntry>>,
    replicas: u32,
    key_source: HashKeySource,
}

impl ConsistentHashBalancer {
    pub fn new(backends: Vec<Arc<Backend>>, replicas: u32, key_source: HashKeySource) -> Self {
        let ring = Self::build_ring(&backends, replicas);
        Self {
            backends: ArcSwap::from_pointee(backends),
            ring: ArcSwap::from_pointee(ring),
            replicas,
            key_source,
        }
    }

    fn build_ring(backends: &[Arc<Backend>], replicas: u32) -> Vec<RingEntry> {
        let mut ring: Vec<RingEntry> = Vec::with_capacity(backends.len() * replicas as usize);
        for (idx, backend) in backends.iter().enumerate() {
            for r in 0..replicas {
                let hash = hash_str(&format!("{}#{}", backend.url, r));
                ring.push(RingEntry { hash, backend_idx: idx });
            }
        }
        ring.sort_by_key(|e| e.hash);
        ring
    }

    fn key_for(&self, ctx: &SelectionContext) -> String {
        match &self.key_source {
            HashKeySource::RemoteAddr => ctx.remote_addr.unwrap_or("").to_string(),
            HashKeySource::Path => ctx.path.to_string(),
            HashKeySource::Header(name) => ctx.header(name).unwrap_or("").to_string(),
            HashKeySource::Cookie(name) => ctx.cookie(name).unwrap_or("").to_string(),
        }
    }
}

impl Balancer for ConsistentHashBalancer {
    fn next(&self, ctx: &SelectionContext) -> Option<Selection> {
        let backends = self.backends.load();
        if backends.is_empty() {
            return None;
        }
        let ring = self.ring.load();
        if ring.is_empty() {
            return None;
        }
        let key_hash = hash_str(&self.key_for(ctx));
        let start = ring.partition_point(|e| e.hash < key_hash);

        for offset in 0..ring.len() {
            let entry = &ring[(start + offset) % ring.len()];
            let backend = &backends[entry.backend_idx];
            if backend.is_healthy() {
                return Some(Selection::plain(backend.clone()));
            }
        }
        None
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        let ring = Self::build_ring(&backends, self.replicas);
        self.backends.store(Arc::new(backends));
        self.ring.store(Arc::new(ring));
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        (**self.backends.load()).clone()
    }
}

/// Deterministic weighted selection: each group appears in an expanded list
/// `weight` times, round-robin over that list (the teacher's
/// `WeightedBalancer` approach, lifted from backends to groups). When
/// `sticky` is set, a client binding (cookie or header) pins to a named
/// group first.
pub struct WeightedGroupsBalancer {
    groups: Vec<(WeightedGroup, Arc<dyn Balancer>)>,
    expanded: Vec<usize>,
    counter: AtomicUsize,
    sticky: Option<StickySpec>,
}

impl WeightedGroupsBalancer {
    pub fn new(groups: Vec<(WeightedGroup, Arc<dyn Balancer>)>, sticky: Option<StickySpec>) -> Self {
        let mut expanded = Vec::new();
        for (idx, (group, _)) in groups.iter().enumerate() {
            for _ in 0..group.weight.max(1) {
                expanded.push(idx);
            }
        }
        Self { groups, expanded, counter: AtomicUsize::new(0), sticky }
    }

    fn group_by_name(&self, name: &str) -> Option<&Arc<dyn Balancer>> {
        self.groups.iter().find(|(g, _)| g.name == name).map(|(_, b)| b)
    }
}

impl Balancer for WeightedGroupsBalancer {
    fn next(&self, ctx: &SelectionContext) -> Option<Selection> {
        if let Some(sticky) = &self.sticky {
            let bound = sticky
                .cookie_name
                .as_deref()
                .and_then(|n| ctx.cookie(n))
                .or_else(|| sticky.header_name.as_deref().and_then(|n| ctx.header(n)));
            if let Some(group_name) = bound {
                if let Some(balancer) = self.group_by_name(group_name) {
                    if let Some(sel) = balancer.next(ctx) {
                        return Some(sel);
                    }
                }
                // bound group missing or empty: fall through to weighted pick
            }
        }

        if self.expanded.is_empty() {
            return None;
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.expanded.len() {
            let idx = self.expanded[(start + offset) % self.expanded.len()];
            let (group, balancer) = &self.groups[idx];
            if let Some(sel) = balancer.next(ctx) {
                let set_cookie = self.sticky.as_ref().and_then(|s| {
                    s.cookie_name.as_ref().map(|name| AffinityCookie {
                        name: name.clone(),
                        value: group.name.clone(),
                        max_age_secs: 60,
                    })
                });
                return Some(Selection { backend: sel.backend, set_cookie });
            }
        }
        None
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        for (_, balancer) in &self.groups {
            balancer.update_backends(backends.clone());
        }
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.groups.iter().flat_map(|(_, b)| b.backends()).collect()
    }
}

/// On first selection, delegates to `inner` and mints an affinity cookie.
/// On subsequent requests, reads the cookie and re-selects that backend if
/// still healthy; otherwise falls back to `inner` and rewrites the cookie.
pub struct SessionAffinityBalancer {
    inner: Arc<dyn Balancer>,
    cookie_name: String,
    ttl_secs: u64,
}

impl SessionAffinityBalancer {
    pub fn new(inner: Arc<dyn Balancer>, cookie_name: String, ttl_secs: u64) -> Self {
        Self { inner, cookie_name, ttl_secs }
    }
}

impl Balancer for SessionAffinityBalancer {
    fn next(&self, ctx: &SelectionContext) -> Option<Selection> {
        if let Some(bound_url) = ctx.cookie(&self.cookie_name) {
            if let Some(backend) = self.inner.backends().into_iter().find(|b| b.url == bound_url) {
                if backend.is_healthy() {
                    return Some(Selection::plain(backend));
                }
            }
        }
        let sel = self.inner.next(ctx)?;
        Some(Selection {
            set_cookie: Some(AffinityCookie {
                name: self.cookie_name.clone(),
                value: sel.backend.url.clone(),
                max_age_secs: self.ttl_secs,
            }),
            backend: sel.backend,
        })
    }

    fn update_backends(&self, backends: Vec<Arc<Backend>>) {
        self.inner.update_backends(backends);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.inner.backends()
    }
}

/// Builds the balancer tree for a route's [`BalancerSpec`] over a flat
/// backend list (used by specs with no sub-groups).
pub fn build_balancer(spec: &BalancerSpec, backends: Vec<Arc<Backend>>) -> Arc<dyn Balancer> {
    match spec {
        BalancerSpec::RoundRobin => Arc::new(RoundRobinBalancer::new(backends)),
        BalancerSpec::LeastConnections => Arc::new(LeastConnectionsBalancer::new(backends)),
        BalancerSpec::LeastResponseTime => Arc::new(LeastResponseTimeBalancer::new(backends)),
        BalancerSpec::ConsistentHash { replicas, key } => {
            Arc::new(ConsistentHashBalancer::new(backends, *replicas, key.clone()))
        }
        BalancerSpec::SessionAffinity { ttl_seconds, cookie_name, inner } => {
            let inner_balancer = build_balancer(inner, backends);
            let cookie = cookie_name.clone().unwrap_or_else(|| "affinity".to_string());
            Arc::new(SessionAffinityBalancer::new(inner_balancer, cookie, *ttl_seconds))
        }
        BalancerSpec::WeightedGroups { groups, sticky } => {
            // Each group's own backend set comes from its config, not the
            // flat list passed in; callers needing per-group backend
            // resolution build groups directly via `build_weighted_groups`.
            let built: Vec<(WeightedGroup, Arc<dyn Balancer>)> = groups
                .iter()
                .map(|g| {
                    let group_backends: Vec<Arc<Backend>> = g
                        .backends
                        .iter()
                        .map(|b| Backend::new(b.url.clone(), b.weight))
                        .collect();
                    (g.clone(), build_balancer(&g.policy, group_backends))
                })
                .collect();
            Arc::new(WeightedGroupsBalancer::new(built, sticky.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n).map(|i| Backend::new(format!("http://b{i}"), 1)).collect()
    }

    fn ctx<'a>() -> SelectionContext<'a> {
        SelectionContext { remote_addr: None, path: "/x", headers: &[], cookies: &[] }
    }

    #[test]
    fn round_robin_cycles_through_backends() {
        let lb = RoundRobinBalancer::new(backends(3));
        let picks: Vec<_> = (0..6).map(|_| lb.next(&ctx()).unwrap().backend.url.clone()).collect();
        assert_eq!(picks, vec!["http://b0", "http://b1", "http://b2", "http://b0", "http://b1", "http://b2"]);
    }

    #[test]
    fn round_robin_skips_unhealthy() {
        let bs = backends(2);
        bs[0].mark_unhealthy();
        let lb = RoundRobinBalancer::new(bs);
        for _ in 0..4 {
            assert_eq!(lb.next(&ctx()).unwrap().backend.url, "http://b1");
        }
    }

    #[test]
    fn returns_none_when_all_unhealthy() {
        let bs = backends(1);
        bs[0].mark_unhealthy();
        let lb = RoundRobinBalancer::new(bs);
        assert!(lb.next(&ctx()).is_none());
    }

    #[test]
    fn least_connections_picks_min_in_flight() {
        let bs = backends(2);
        bs[0].begin_request();
        bs[0].begin_request();
        let lb = LeastConnectionsBalancer::new(bs);
        assert_eq!(lb.next(&ctx()).unwrap().backend.url, "http://b1");
    }

    #[test]
    fn consistent_hash_is_stable_for_same_key() {
        let lb = ConsistentHashBalancer::new(backends(5), 100, HashKeySource::RemoteAddr);
        let c = SelectionContext { remote_addr: Some("1.2.3.4"), path: "/x", headers: &[], cookies: &[] };
        let first = lb.next(&c).unwrap().backend.url.clone();
        for _ in 0..10 {
            assert_eq!(lb.next(&c).unwrap().backend.url, first);
        }
    }

    #[test]
    fn consistent_hash_falls_over_to_next_healthy() {
        let bs = backends(3);
        let lb = ConsistentHashBalancer::new(bs.clone(), 100, HashKeySource::RemoteAddr);
        let c = SelectionContext { remote_addr: Some("5.6.7.8"), path: "/x", headers: &[], cookies: &[] };
        let chosen = lb.next(&c).unwrap().backend.url.clone();
        for b in &bs {
            if b.url == chosen {
                b.mark_unhealthy();
            }
        }
        let fallback = lb.next(&c).unwrap().backend.url.clone();
        assert_ne!(fallback, chosen);
    }

    #[test]
    fn session_affinity_sticks_to_first_choice() {
        let inner = Arc::new(RoundRobinBalancer::new(backends(3)));
        let lb = SessionAffinityBalancer::new(inner, "affinity".into(), 60);
        let sel1 = lb.next(&ctx()).unwrap();
        let cookie = sel1.set_cookie.clone().unwrap();
        assert_eq!(cookie.name, "affinity");

        let bound_ctx = SelectionContext { remote_addr: None, path: "/x", headers: &[], cookies: &[(cookie.name.clone(), cookie.value.clone())] };
        let sel2 = lb.next(&bound_ctx).unwrap();
        assert_eq!(sel2.backend.url, sel1.backend.url);
        assert!(sel2.set_cookie.is_none());
    }

    #[test]
    fn weighted_groups_respects_sticky_binding() {
        let g1 = WeightedGroup { name: "canary".into(), weight: 1, backends: vec![], policy: Box::new(BalancerSpec::RoundRobin) };
        let g2 = WeightedGroup { name: "stable".into(), weight: 9, backends: vec![], policy: Box::new(BalancerSpec::RoundRobin) };
        let b1: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(backends(1)));
        let b2: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![Backend::new("http://stable0".into(), 1)]));
        let lb = WeightedGroupsBalancer::new(vec![(g1, b1), (g2, b2)], Some(StickySpec { cookie_name: Some("grp".into()), header_name: None }));
        let bound_ctx = SelectionContext { remote_addr: None, path: "/x", headers: &[], cookies: &[("grp".into(), "canary".into())] };
        let sel = lb.next(&bound_ctx).unwrap();
        assert_eq!(sel.backend.url, "http://b0");
    }
}
