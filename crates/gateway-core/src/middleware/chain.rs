//! Canonical middleware stage registry and chain builder (§4.2).
//!
//! New relative to the teacher, which only has two ad hoc middlewares
//! (`rate_limit`, `transform`) wired directly into actix-web's `.wrap()`
//! chain. This generalizes that into a named, ordered, anchor-addressable
//! stage list: every stage in the canonical order is a slot that either
//! contributes a `Middleware` or is inert, and user extensions splice in by
//! naming an `after`/`before` anchor.

use crate::middleware::rate_limit::RateLimitStore;
use crate::models::context::VariableContext;
use crate::models::error::GatewayError;
use crate::models::router::RouteConfig;
use crate::services::route_proxy::{ProxyRequest, ProxyResponse};
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A composed request handler: takes the per-request scratch context and the
/// inbound request, returns the outbound response (or a terminating error).
pub type Handler = Arc<dyn Fn(VariableContext, ProxyRequest) -> BoxFuture<'static, Result<ProxyResponse, GatewayError>> + Send + Sync>;

/// Wraps an inner handler with additional behavior.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// The fixed, total-ordered list of named middleware slots (§4.2), grouped by
/// phase in file order. A route's chain always visits them in this order;
/// only the set of slots that produce a live `Middleware` varies by route.
pub const CANONICAL_STAGES: &[&str] = &[
    // 1. Ingress filtering
    "request_id", "recovery", "real_ip", "https_redirect", "allowed_hosts", "admission",
    "alt_svc", "client_cert_capture", "trace_context", "access_log",
    // 2. Observation & routing policy
    "metrics_tap", "slo_tracker", "traffic_observer", "ip_allow_deny", "geo_restriction",
    "maintenance_mode", "bot_policy",
    // 3. Control
    "cors", "security_headers", "variable_context_setup", "versioning", "deprecation_headers",
    "request_timeout", "rate_limit", "spike_arrest", "quota", "throttle", "request_queue",
    // 4. Authentication & authorization
    "primary_auth", "token_revocation_check", "token_exchange", "claims_propagation",
    "external_auth_callout", "policy_engine", "nonce", "csrf", "request_signature_verification",
    "idempotency", "deduplication", "priority_admission", "baggage_propagation", "tenant_routing",
    "consumer_group", "cost_tracking", "rule_engine_request",
    // 5. Body ingestion & transformation
    "waf", "fault_injection", "traffic_recording", "mock_response", "scripting_request",
    "wasm_request", "body_size_limit", "connect_handling", "decompression", "bandwidth_shaping",
    "field_encryption", "request_validation", "openapi_request_validation", "graphql_parse",
    "ai_prompt_guard", "websocket_upgrade", "response_cache_lookup",
    // 6. Resilience wrap around upstream call
    "single_flight", "circuit_breaker", "outlier_ejection", "adaptive_concurrency",
    "backpressure", "proxy_rate_limit", "streaming_tuning", "response_body_limit",
    "compression", "etag",
    // 7. Response-phase
    "rule_engine_response", "mirror_fanout", "traffic_group_response", "session_affinity_cookie",
    "request_body_transform", "body_generation", "header_modifiers", "param_forwarding",
    "backend_auth_injection", "backend_request_signing", "response_body_transform",
    "wasm_response", "jmespath_extraction", "status_remap", "content_replacement",
    "pii_redaction", "field_replacement", "response_body_generation", "error_handling",
    "content_negotiation", "response_signing",
];

/// A user-registered middleware extension (§4.2's "User middleware
/// extension"), spliced into the canonical order by anchor name.
#[derive(Clone)]
pub struct ExtensionSpec {
    pub name: String,
    pub build_fn: Arc<dyn Fn(&RouteConfig) -> Option<Middleware> + Send + Sync>,
    pub after: Option<String>,
    pub before: Option<String>,
}

/// Resolves anchor positions and inserts each extension into `names`,
/// logging and skipping it (not erroring the whole build) when an anchor is
/// missing or `after`/`before` are inconsistent, per §4.2.
fn splice_extensions(route_id: &str, names: &mut Vec<String>, extensions: &[ExtensionSpec]) {
    for ext in extensions {
        let after_idx = ext.after.as_ref().and_then(|a| names.iter().position(|n| n == a));
        let before_idx = ext.before.as_ref().and_then(|b| names.iter().position(|n| n == b));

        let insert_at = match (&ext.after, &ext.before) {
            (Some(a), None) => match after_idx {
                Some(idx) => idx + 1,
                None => {
                    warn!("route {route_id}: extension {} has unknown after-anchor {a}, skipping", ext.name);
                    continue;
                }
            },
            (None, Some(b)) => match before_idx {
                Some(idx) => idx,
                None => {
                    warn!("route {route_id}: extension {} has unknown before-anchor {b}, skipping", ext.name);
                    continue;
                }
            },
            (Some(_), Some(_)) => match (after_idx, before_idx) {
                (Some(a), Some(b)) if a < b => b,
                (Some(_), Some(_)) => {
                    warn!("route {route_id}: extension {} has inconsistent after/before ordering, skipping", ext.name);
                    continue;
                }
                _ => {
                    warn!("route {route_id}: extension {} has an unknown anchor, skipping", ext.name);
                    continue;
                }
            },
            (None, None) => names.len(),
        };
        names.insert(insert_at, ext.name.clone());
    }
}

/// Builds the single composed handler for a route: canonical stages wrap
/// `inner` from outermost (phase 1) to innermost, with `extensions` spliced
/// in by anchor.
pub fn build_chain(
    route: &RouteConfig,
    rate_limit_store: &Arc<RateLimitStore>,
    extensions: &[ExtensionSpec],
    inner: Handler,
) -> Handler {
    let mut names: Vec<String> = CANONICAL_STAGES.iter().map(|s| s.to_string()).collect();
    splice_extensions(&route.id, &mut names, extensions);

    let mut handler = inner;
    for name in names.into_iter().rev() {
        let middleware = build_canonical_stage(&name, route, rate_limit_store)
            .or_else(|| extensions.iter().find(|e| e.name == name).and_then(|e| (e.build_fn)(route)));
        if let Some(mw) = middleware {
            handler = mw(handler);
        }
    }
    handler
}

/// Concrete behavior for the canonical stages this crate implements;
/// everything else is an inert, correctly-ordered, anchor-addressable slot
/// until a comparable teacher/pack behavior exists (§4.2 explicitly licenses
/// this).
fn build_canonical_stage(name: &str, route: &RouteConfig, rate_limit_store: &Arc<RateLimitStore>) -> Option<Middleware> {
    match name {
        "request_id" => Some(Arc::new(|inner: Handler| -> Handler {
            Arc::new(move |mut ctx, req| {
                if ctx.request_id.is_empty() {
                    ctx.request_id = uuid::Uuid::new_v4().to_string();
                }
                inner(ctx, req)
            })
        })),

        "recovery" => Some(Arc::new(|inner: Handler| -> Handler {
            Arc::new(move |ctx, req| {
                let inner = inner.clone();
                Box::pin(async move {
                    match futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(inner(ctx, req))).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::Internal { message: "panic in handler chain".into() }),
                    }
                })
            })
        })),

        "access_log" => Some(Arc::new(|inner: Handler| -> Handler {
            Arc::new(move |ctx, req| {
                let inner = inner.clone();
                Box::pin(async move {
                    let started = Instant::now();
                    let method = req.method.clone();
                    let path = req.path.clone();
                    let request_id = ctx.request_id.clone();
                    let result = inner(ctx, req).await;
                    let elapsed_ms = started.elapsed().as_millis();
                    match &result {
                        Ok(resp) => info!("{method} {path} -> {} ({elapsed_ms}ms) request_id={request_id}", resp.status),
                        Err(err) => info!("{method} {path} -> error {err} ({elapsed_ms}ms) request_id={request_id}"),
                    }
                    result
                })
            })
        })),

        "cors" => route.feature_flags.cors.then(|| {
            let mw: Middleware = Arc::new(|inner: Handler| -> Handler {
                Arc::new(move |ctx, req| {
                    let inner = inner.clone();
                    Box::pin(async move {
                        let mut result = inner(ctx, req).await;
                        if let Ok(resp) = &mut result {
                            resp.headers.push(("Access-Control-Allow-Origin".into(), "*".into()));
                        }
                        result
                    })
                })
            });
            mw
        }),

        "security_headers" => Some(Arc::new(|inner: Handler| -> Handler {
            Arc::new(move |ctx, req| {
                let inner = inner.clone();
                Box::pin(async move {
                    let mut result = inner(ctx, req).await;
                    if let Ok(resp) = &mut result {
                        resp.headers.push(("X-Content-Type-Options".into(), "nosniff".into()));
                        resp.headers.push(("X-Frame-Options".into(), "DENY".into()));
                        resp.headers.push(("Referrer-Policy".into(), "no-referrer".into()));
                    }
                    result
                })
            })
        })),

        "rate_limit" => {
            let spec = route.feature_flags.rate_limit.clone()?;
            let store = rate_limit_store.clone();
            let route_id = route.id.clone();
            Some(Arc::new(move |inner: Handler| -> Handler {
                let spec = spec.clone();
                let store = store.clone();
                let route_id = route_id.clone();
                Arc::new(move |ctx, req| {
                    if ctx.skip(crate::models::context::SkipFlags::RATE_LIMIT) {
                        return inner(ctx, req);
                    }
                    let key = req.remote_addr.clone().unwrap_or_default();
                    if store.check(&format!("{route_id}:{key}"), &spec) {
                        inner(ctx, req)
                    } else {
                        Box::pin(async { Err(GatewayError::RateLimited { retry_after_secs: 1 }) })
                    }
                })
            }))
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{BackendConfig, BackendsRef, BalancerSpec, MatchSpec};
    use bytes::Bytes;

    fn route() -> RouteConfig {
        RouteConfig {
            id: "r1".into(),
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

    fn req() -> ProxyRequest {
        ProxyRequest { method: "GET".into(), path: "/x".into(), query: "".into(), headers: vec![], cookies: vec![], body: Bytes::new(), remote_addr: Some("1.2.3.4".into()), idempotency_key_present: false }
    }

    fn echo_inner() -> Handler {
        Arc::new(|_ctx, _req| Box::pin(async { Ok(ProxyResponse { status: 200, headers: vec![], body: Bytes::new(), set_cookies: vec![] }) }))
    }

    #[tokio::test]
    async fn security_headers_are_always_added() {
        let store = Arc::new(RateLimitStore::new());
        let handler = build_chain(&route(), &store, &[], echo_inner());
        let resp = handler(VariableContext::new("r".into()), req()).await.unwrap();
        assert!(resp.headers.iter().any(|(n, _)| n == "X-Frame-Options"));
    }

    #[tokio::test]
    async fn cors_header_only_added_when_flag_set() {
        let store = Arc::new(RateLimitStore::new());
        let handler = build_chain(&route(), &store, &[], echo_inner());
        let resp = handler(VariableContext::new("r".into()), req()).await.unwrap();
        assert!(!resp.headers.iter().any(|(n, _)| n == "Access-Control-Allow-Origin"));

        let mut r = route();
        r.feature_flags.cors = true;
        let handler = build_chain(&r, &store, &[], echo_inner());
        let resp = handler(VariableContext::new("r".into()), req()).await.unwrap();
        assert!(resp.headers.iter().any(|(n, _)| n == "Access-Control-Allow-Origin"));
    }

    #[tokio::test]
    async fn rate_limit_stage_rejects_over_burst() {
        let store = Arc::new(RateLimitStore::new());
        let mut r = route();
        r.feature_flags.rate_limit = Some(crate::middleware::rate_limit::RateLimitSpec { requests_per_second: 0.0, burst: 1 });
        let handler = build_chain(&r, &store, &[], echo_inner());
        assert!(handler(VariableContext::new("r".into()), req()).await.is_ok());
        assert!(matches!(handler(VariableContext::new("r".into()), req()).await, Err(GatewayError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn extension_splices_after_named_anchor() {
        let store = Arc::new(RateLimitStore::new());
        let ext = ExtensionSpec {
            name: "my_ext".into(),
            after: Some("security_headers".into()),
            before: None,
            build_fn: Arc::new(|_route| {
                let mw: Middleware = Arc::new(|inner: Handler| -> Handler {
                    Arc::new(move |ctx, req| {
                        let inner = inner.clone();
                        Box::pin(async move {
                            let mut result = inner(ctx, req).await;
                            if let Ok(resp) = &mut result {
                                resp.headers.push(("X-Ext".into(), "1".into()));
                            }
                            result
                        })
                    })
                });
                Some(mw)
            }),
        };
        let handler = build_chain(&route(), &store, &[ext], echo_inner());
        let resp = handler(VariableContext::new("r".into()), req()).await.unwrap();
        assert!(resp.headers.iter().any(|(n, _)| n == "X-Ext"));
    }

    #[tokio::test]
    async fn extension_with_unknown_anchor_is_skipped_not_fatal() {
        let store = Arc::new(RateLimitStore::new());
        let ext = ExtensionSpec {
            name: "my_ext".into(),
            after: Some("does_not_exist".into()),
            before: None,
            build_fn: Arc::new(|_route| -> Option<Middleware> { panic!("should never build") }),
        };
        let handler = build_chain(&route(), &store, &[ext], echo_inner());
        assert!(handler(VariableContext::new("r".into()), req()).await.is_ok());
    }
}
