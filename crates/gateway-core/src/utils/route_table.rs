//! Route table: compiles a config generation's routes into a structure that
//! answers `match(method, host, path, headers, query) -> Option<(RouteConfig,
//! path_params)>` in sorted, deterministic order (§4.1).
//!
//! Generalizes `kairos-rs::utils::route_matcher::RouteMatcher`, which only
//! keyed on path (static hash map + regex-compiled dynamic routes sorted by
//! parameter count). This expands matching to the full `MatchSpec`: method
//! set, host set (exact + `*.domain` wildcard), header/query predicates, and
//! orders routes by `(−priority, −specificity, insertion-order)` instead of
//! param-count alone.

use crate::models::router::RouteConfig;
use ahash::HashMap as AHashMap;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RouteTableError {
    #[error("invalid route pattern: {pattern}")]
    InvalidPattern { pattern: String },
    #[error("regex compilation failed: {0}")]
    RegexError(String),
}

/// A route compiled for matching: static prefix literal, or a regex for
/// captures/trailing wildcard, plus the ordering key it was sorted on.
struct CompiledRoute {
    config: Arc<RouteConfig>,
    regex: Regex,
    param_names: Vec<String>,
}

/// Immutable once built; safe to share across request tasks without locking.
/// One `RouteTable` per config generation (§5: readers snapshot it at
/// dispatch).
pub struct RouteTable {
    /// Exact-literal paths with no params, for O(1) lookup before falling
    /// back to the compiled list.
    static_index: AHashMap<String, Vec<usize>>,
    /// Indices of routes with params or a trailing wildcard, in sorted
    /// order; merged against any static hit so a higher-priority dynamic
    /// route can still win over a lower-priority literal one.
    dynamic_indices: Vec<usize>,
    compiled: Vec<CompiledRoute>,
}

pub struct MatchResult<'a> {
    pub route: &'a RouteConfig,
    pub path_params: std::collections::HashMap<String, String>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self, RouteTableError> {
        let mut indexed: Vec<(usize, RouteConfig)> = routes.into_iter().enumerate().collect();
        // (−priority, −specificity, insertion-order): stable sort on the
        // insertion index preserves file order for ties.
        indexed.sort_by(|(ia, a), (ib, b)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.path_specificity().cmp(&a.path_specificity()))
                .then_with(|| ia.cmp(ib))
        });

        let mut compiled = Vec::with_capacity(indexed.len());
        let mut static_index: AHashMap<String, Vec<usize>> = AHashMap::default();
        let mut dynamic_indices = Vec::new();

        for (_, config) in indexed {
            let (pattern, param_names) = Self::convert_pattern_to_regex(&config.match_spec.path)?;
            let regex = Regex::new(&pattern).map_err(|e| RouteTableError::RegexError(e.to_string()))?;
            let idx = compiled.len();
            if param_names.is_empty() && !config.match_spec.path.ends_with("/*") {
                static_index
                    .entry(config.match_spec.path.clone())
                    .or_default()
                    .push(idx);
            } else {
                dynamic_indices.push(idx);
            }
            compiled.push(CompiledRoute { config: Arc::new(config), regex, param_names });
        }

        Ok(Self { static_index, dynamic_indices, compiled })
    }

    /// Scans in sorted order; first route whose method, host, path, and
    /// predicates all match wins.
    pub fn find_match<'a>(
        &'a self,
        method: &str,
        host: Option<&str>,
        path: &str,
        headers: &[(String, String)],
        query: &[(String, String)],
    ) -> Option<MatchResult<'a>> {
        // A literal hit only rules out other literal routes, not dynamic
        // ones — a higher-priority `{param}` route must still be able to
        // win, so the two index sets are merged back into sorted order
        // rather than short-circuiting on the static lookup alone.
        let mut candidate_indices: Vec<usize> = match self.static_index.get(path) {
            Some(indices) => {
                let mut merged = indices.clone();
                merged.extend_from_slice(&self.dynamic_indices);
                merged
            }
            None => self.dynamic_indices.clone(),
        };
        candidate_indices.sort_unstable();

        for idx in candidate_indices {
            let compiled = &self.compiled[idx];
            let config = &compiled.config;

            if !Self::method_matches(&config.match_spec.methods, method) {
                continue;
            }
            if !Self::host_matches(&config.match_spec.hosts, host) {
                continue;
            }
            let Some(captures) = compiled.regex.captures(path) else {
                continue;
            };
            if !Self::predicates_match(&config.match_spec.header_predicates, headers) {
                continue;
            }
            if !Self::predicates_match(&config.match_spec.query_predicates, query) {
                continue;
            }

            let mut path_params = std::collections::HashMap::new();
            for (i, name) in compiled.param_names.iter().enumerate() {
                if let Some(m) = captures.get(i + 1) {
                    path_params.insert(name.clone(), m.as_str().to_string());
                }
            }
            return Some(MatchResult { route: config, path_params });
        }

        None
    }

    fn method_matches(allowed: &[String], method: &str) -> bool {
        allowed.is_empty() || allowed.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn host_matches(allowed: &[String], host: Option<&str>) -> bool {
        if allowed.is_empty() {
            return true;
        }
        let Some(host) = host else { return false };
        allowed.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(suffix) && host.len() > suffix.len()
            } else {
                pattern == host
            }
        })
    }

    fn predicates_match(predicates: &[crate::models::router::FieldPredicate], actual: &[(String, String)]) -> bool {
        predicates.iter().all(|pred| {
            actual.iter().any(|(name, value)| {
                name.eq_ignore_ascii_case(&pred.name)
                    && pred.value.as_ref().is_none_or(|expected| expected == value)
            })
        })
    }

    /// Converts `/api/users/{id}/*` into a regex, capturing `{param}`
    /// segments and, if present, a trailing `*` wildcard as `tail`.
    fn convert_pattern_to_regex(pattern: &str) -> Result<(String, Vec<String>), RouteTableError> {
        let mut regex_pattern = String::with_capacity(pattern.len() * 2);
        regex_pattern.push('^');
        let mut param_names = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        if inner.is_alphanumeric() || inner == '_' {
                            name.push(inner);
                        } else {
                            return Err(RouteTableError::InvalidPattern { pattern: pattern.to_string() });
                        }
                    }
                    if !closed || name.is_empty() {
                        return Err(RouteTableError::InvalidPattern { pattern: pattern.to_string() });
                    }
                    regex_pattern.push_str("([^/]+)");
                    param_names.push(name);
                }
                '*' if chars.peek().is_none() => {
                    // trailing wildcard: capture the rest, including slashes
                    regex_pattern.push_str("(.*)");
                    param_names.push("tail".to_string());
                }
                '.' | '?' | '+' | '^' | '$' | '[' | ']' | '(' | ')' | '|' | '\\' => {
                    regex_pattern.push('\\');
                    regex_pattern.push(ch);
                }
                _ => regex_pattern.push(ch),
            }
        }
        regex_pattern.push('$');
        Ok((regex_pattern, param_names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{BackendConfig, BackendsRef, BalancerSpec, MatchSpec};

    fn route(id: &str, path: &str, priority: i32) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            priority,
            match_spec: MatchSpec { methods: vec!["GET".into()], hosts: vec![], path: path.into(), header_predicates: vec![], query_predicates: vec![] },
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
    fn static_route_wins_o1_lookup() {
        let table = RouteTable::new(vec![route("r1", "/health", 0)]).unwrap();
        let m = table.find_match("GET", None, "/health", &[], &[]).unwrap();
        assert_eq!(m.route.id, "r1");
    }

    #[test]
    fn dynamic_route_extracts_params() {
        let table = RouteTable::new(vec![route("r1", "/users/{id}", 0)]).unwrap();
        let m = table.find_match("GET", None, "/users/42", &[], &[]).unwrap();
        assert_eq!(m.path_params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn literal_beats_capture_at_same_priority() {
        let table = RouteTable::new(vec![
            route("dynamic", "/users/{id}", 0),
            route("literal", "/users/active", 0),
        ])
        .unwrap();
        let m = table.find_match("GET", None, "/users/active", &[], &[]).unwrap();
        assert_eq!(m.route.id, "literal");
    }

    #[test]
    fn higher_priority_wins_even_if_less_specific() {
        let table = RouteTable::new(vec![
            route("low", "/users/active", 0),
            route("high", "/users/{id}", 10),
        ])
        .unwrap();
        let m = table.find_match("GET", None, "/users/active", &[], &[]).unwrap();
        assert_eq!(m.route.id, "high");
    }

    #[test]
    fn method_mismatch_excludes_route() {
        let table = RouteTable::new(vec![route("r1", "/users", 0)]).unwrap();
        assert!(table.find_match("POST", None, "/users", &[], &[]).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let table = RouteTable::new(vec![route("r1", "/users", 0)]).unwrap();
        assert!(table.find_match("GET", None, "/missing", &[], &[]).is_none());
    }

    #[test]
    fn wildcard_host_matches_subdomain() {
        let mut r = route("r1", "/users", 0);
        r.match_spec.hosts = vec!["*.example.com".into()];
        let table = RouteTable::new(vec![r]).unwrap();
        assert!(table.find_match("GET", Some("api.example.com"), "/users", &[], &[]).is_some());
        assert!(table.find_match("GET", Some("example.com"), "/users", &[], &[]).is_none());
    }

    #[test]
    fn header_predicate_must_match() {
        let mut r = route("r1", "/users", 0);
        r.match_spec.header_predicates = vec![crate::models::router::FieldPredicate { name: "x-api-version".into(), value: Some("2".into()) }];
        let table = RouteTable::new(vec![r]).unwrap();
        assert!(table.find_match("GET", None, "/users", &[("x-api-version".into(), "2".into())], &[]).is_some());
        assert!(table.find_match("GET", None, "/users", &[], &[]).is_none());
    }
}
