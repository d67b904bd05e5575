//! Route proxy: executes the upstream call for a matched route (§4.5).
//!
//! Generalizes `kairos-rs::services::http::RouteHandler::handle_request_internal`,
//! keeping its match → circuit-breaker → header-filter → forward → retry
//! loop shape. Adds balancer re-consultation between attempts (the teacher
//! picks a backend once per request), mirror fan-out, and moves header
//! filtering and retry backoff onto the generalized [`RetryPolicy`]/
//! [`CircuitBreakerSpec`] types.

use crate::models::error::GatewayError;
use crate::models::router::RouteConfig;
use crate::services::adaptive_concurrency::AdaptiveLimiter;
use crate::services::backend::Backend;
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::services::load_balancer::{Balancer, SelectionContext};
use crate::services::outlier::{OutlierDetector, OutlierDetectorSpec};
use crate::services::transport::TransportPool;
use crate::utils::path::join_backend_url;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const HOP_BY_HOP: &[&str] = &["host", "connection", "upgrade", "proxy-connection", "keep-alive", "te", "trailers", "transfer-encoding"];

/// Everything the proxy needs from the inbound request; built by the
/// dispatcher from the actix-web `HttpRequest`/body.
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: Bytes,
    pub remote_addr: Option<String>,
    pub idempotency_key_present: bool,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub set_cookies: Vec<String>,
}

const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "PUT", "DELETE"];

/// One `RouteProxy` per compiled route. Owns the route's balancer, the
/// transport it dials through, and a circuit breaker per upstream identity
/// (one per backend URL if `per_backend`, else one shared breaker).
pub struct RouteProxy {
    route: Arc<RouteConfig>,
    balancer: Arc<dyn Balancer>,
    mirror_balancer: Option<Arc<dyn Balancer>>,
    transport: Arc<TransportPool>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    shared_breaker: Option<Arc<CircuitBreaker>>,
    adaptive_limiter: AdaptiveLimiter,
    outlier_detector: Arc<OutlierDetector>,
}

impl RouteProxy {
    pub fn new(
        route: Arc<RouteConfig>,
        balancer: Arc<dyn Balancer>,
        mirror_balancer: Option<Arc<dyn Balancer>>,
        transport: Arc<TransportPool>,
    ) -> Self {
        let spec = route.circuit_breaker.clone();
        let backends = balancer.backends();
        let (breakers, shared_breaker) = if spec.per_backend {
            let mut map = HashMap::new();
            for backend in &backends {
                map.insert(backend.url.clone(), Arc::new(CircuitBreaker::new(backend.url.clone(), spec.clone())));
            }
            (map, None)
        } else {
            (HashMap::new(), Some(Arc::new(CircuitBreaker::new(route.id.clone(), spec))))
        };

        let adaptive_limiter = AdaptiveLimiter::new(route.adaptive_concurrency.clone());

        let outlier_detector = Arc::new(OutlierDetector::new(OutlierDetectorSpec::default()));
        for backend in backends {
            outlier_detector.track(backend);
        }

        Self { route, balancer, mirror_balancer, transport, breakers, shared_breaker, adaptive_limiter, outlier_detector }
    }

    fn breaker_for(&self, backend_url: &str) -> Option<Arc<CircuitBreaker>> {
        self.shared_breaker.clone().or_else(|| self.breakers.get(backend_url).cloned())
    }

    fn is_retryable_method(&self, method: &str) -> bool {
        if IDEMPOTENT_METHODS.contains(&method) {
            return true;
        }
        method == "POST" && self.route.retry_policy.retry_post
    }

    fn filter_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)))
            .cloned()
            .collect()
    }

    /// Runs the request-time procedure from §4.5: select, build, dial,
    /// record, retry, mirror.
    pub async fn proxy(&self, req: &ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let Some(permit) = self.adaptive_limiter.try_admit() else {
            return Err(GatewayError::Shedding);
        };
        let started = Instant::now();
        let result = self.proxy_inner(req).await;
        permit.release(started.elapsed().as_micros() as u64);
        result
    }

    async fn proxy_inner(&self, req: &ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let retry_policy = &self.route.retry_policy;
        let can_retry = self.is_retryable_method(&req.method) || req.idempotency_key_present;
        let max_attempts = if can_retry { retry_policy.max_attempts.max(1) } else { 1 };

        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            let selection_ctx = SelectionContext {
                remote_addr: req.remote_addr.as_deref(),
                path: &req.path,
                headers: &req.headers,
                cookies: &req.cookies,
            };
            let Some(selection) = self.balancer.next(&selection_ctx) else {
                return Err(GatewayError::NoBackend { route: self.route.id.clone() });
            };
            let backend = selection.backend;

            let Some(breaker) = self.breaker_for(&backend.url) else {
                return Err(GatewayError::Config { route: self.route.id.clone(), message: "no circuit breaker configured".into() });
            };

            match self.attempt(&backend, req, &breaker).await {
                Ok(mut response) => {
                    if attempt + 1 < max_attempts && self.should_retry_status(response.status, retry_policy) {
                        last_err = Some(GatewayError::Upstream { message: format!("upstream responded with status {}", response.status) });
                    } else {
                        if let Some(cookie) = selection.set_cookie {
                            response.set_cookies.push(format!("{}={}; Max-Age={}; Path=/", cookie.name, cookie.value, cookie.max_age_secs));
                        }
                        self.fire_mirror(req);
                        return Ok(response);
                    }
                }
                Err(CircuitBreakerError::CircuitOpen) => {
                    last_err = Some(GatewayError::CircuitOpen { service: backend.url.clone() });
                }
                Err(CircuitBreakerError::OperationFailed(err)) => {
                    let retryable = self.is_retryable_error(&err, retry_policy);
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt + 1 < max_attempts {
                tokio::time::sleep(retry_policy.backoff_for_attempt(attempt)).await;
            }
        }

        Err(last_err.unwrap_or(GatewayError::AllRetriesExhausted { route: self.route.id.clone() }))
    }

    fn is_retryable_error(&self, err: &GatewayError, policy: &crate::models::router::RetryPolicy) -> bool {
        match err {
            GatewayError::UpstreamTimeout { .. } => policy.retry_conditions.timeout,
            GatewayError::Upstream { .. } => policy.retry_conditions.network_error,
            _ => false,
        }
    }

    /// Whether an upstream response with `status` should be retried against
    /// a different backend rather than passed through, per `{idempotent_5xx,
    /// specific_status_codes}` (§4.5 retry conditions).
    fn should_retry_status(&self, status: u16, policy: &crate::models::router::RetryPolicy) -> bool {
        (status >= 500 && policy.retry_conditions.idempotent_5xx) || policy.retry_conditions.specific_status_codes.contains(&status)
    }

    /// Dials `backend` under circuit-breaker admission. Unlike [`CircuitBreaker::call`],
    /// this classifies the outcome by HTTP status rather than by whether the
    /// future resolved to `Err`: a 5xx response still counts as a breaker
    /// failure (§4.5, S5), but is returned as `Ok` so a non-retryable 5xx can
    /// be passed through to the caller verbatim instead of being translated
    /// into a synthetic gateway error.
    async fn attempt(
        &self,
        backend: &Arc<Backend>,
        req: &ProxyRequest,
        breaker: &CircuitBreaker,
    ) -> Result<ProxyResponse, CircuitBreakerError<GatewayError>> {
        if !breaker.try_admit() {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        let target = join_backend_url(&backend.url, &format!("{}{}", req.path, req.query));
        let timeout_ms = self.route.timeout_policy.per_attempt_ms;
        let client = self
            .transport
            .client_for(self.route.transport_ref.as_deref())
            .map_err(|e| CircuitBreakerError::OperationFailed(GatewayError::Internal { message: e.to_string() }))?;

        if let Some(host) = url::Url::parse(&backend.url).ok().and_then(|u| u.host_str().map(str::to_string)) {
            if let Err(reason) = self.transport.check_ssrf(self.route.transport_ref.as_deref(), &host).await {
                breaker.record_outcome(false);
                self.outlier_detector.record_failure(&backend.url);
                return Err(CircuitBreakerError::OperationFailed(GatewayError::Upstream { message: reason }));
            }
        }

        backend.begin_request();
        let started = Instant::now();

        let dial_result: Result<reqwest::Response, GatewayError> = async {
            let method = reqwest::Method::from_bytes(req.method.as_bytes())
                .map_err(|e| GatewayError::InvalidRequest { message: e.to_string() })?;
            let mut builder = client.request(method, &target).body(req.body.clone());
            for (name, value) in Self::filter_headers(&req.headers) {
                builder = builder.header(name, value);
            }

            match timeout(Duration::from_millis(timeout_ms), builder.send()).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(GatewayError::Upstream { message: e.to_string() }),
                Err(_) => Err(GatewayError::UpstreamTimeout { timeout_ms }),
            }
        }
        .await;

        let elapsed_us = started.elapsed().as_micros() as u64;
        backend.end_request();
        backend.record_latency(elapsed_us);

        let upstream = match dial_result {
            Ok(upstream) => upstream,
            Err(e) => {
                breaker.record_outcome(false);
                self.outlier_detector.record_failure(&backend.url);
                return Err(CircuitBreakerError::OperationFailed(e));
            }
        };

        let status = upstream.status().as_u16();
        let headers: Vec<(String, String)> = upstream
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h)))
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                breaker.record_outcome(false);
                self.outlier_detector.record_failure(&backend.url);
                return Err(CircuitBreakerError::OperationFailed(GatewayError::Upstream { message: e.to_string() }));
            }
        };

        let success = status < 500;
        breaker.record_outcome(success);
        if success {
            self.outlier_detector.record_success(&backend.url);
        } else {
            self.outlier_detector.record_failure(&backend.url);
        }
        Ok(ProxyResponse { status, headers, body, set_cookies: vec![] })
    }

    /// Fires an independent, non-blocking duplicate request at the mirror
    /// backend(s) if configured; errors are counted, never surfaced.
    fn fire_mirror(&self, req: &ProxyRequest) {
        let Some(mirror_spec) = &self.route.mirror else { return };
        let Some(balancer) = &self.mirror_balancer else { return };

        if mirror_spec.sample_fraction < 1.0 && rand::random::<f64>() > mirror_spec.sample_fraction {
            return;
        }

        let selection_ctx = SelectionContext { remote_addr: req.remote_addr.as_deref(), path: &req.path, headers: &req.headers, cookies: &req.cookies };
        let Some(selection) = balancer.next(&selection_ctx) else { return };
        let backend = selection.backend;
        let Ok(client) = self.transport.client_for(None) else { return };

        let target = join_backend_url(&backend.url, &format!("{}{}", req.path, req.query));
        let method = req.method.clone();
        let body = req.body.clone();
        let headers = Self::filter_headers(&req.headers);

        tokio::spawn(async move {
            let Ok(reqwest_method) = reqwest::Method::from_bytes(method.as_bytes()) else { return };
            let mut builder = client.request(reqwest_method, &target).body(body);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            if let Err(e) = builder.send().await {
                debug!("mirror request to {target} failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::router::{BackendConfig, BackendsRef, BalancerSpec, MatchSpec};
    use crate::services::load_balancer::RoundRobinBalancer;

    fn route() -> Arc<RouteConfig> {
        Arc::new(RouteConfig {
            id: "r1".into(),
            priority: 0,
            match_spec: MatchSpec { methods: vec![], hosts: vec![], path: "/x".into(), header_predicates: vec![], query_predicates: vec![] },
            auth_required: false,
            auth_methods: vec![],
            backends_ref: BackendsRef::Inline { backends: vec![BackendConfig { url: "http://127.0.0.1:1".into(), weight: 1 }] },
            balancer: BalancerSpec::RoundRobin,
            transport_ref: None,
            retry_policy: Default::default(),
            timeout_policy: crate::models::router::TimeoutPolicy { per_attempt_ms: 200 },
            circuit_breaker: Default::default(),
            adaptive_concurrency: Default::default(),
            mirror: None,
            redirect_policy: Default::default(),
            feature_flags: Default::default(),
        })
    }

    fn req() -> ProxyRequest {
        ProxyRequest {
            method: "GET".into(),
            path: "/x".into(),
            query: "".into(),
            headers: vec![],
            cookies: vec![],
            body: Bytes::new(),
            remote_addr: Some("1.2.3.4".into()),
            idempotency_key_present: false,
        }
    }

    #[tokio::test]
    async fn connection_refused_surfaces_as_upstream_error() {
        let route = route();
        let backend = Backend::new("http://127.0.0.1:1".into(), 1);
        let balancer: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![backend]));
        let transport = Arc::new(TransportPool::new(Default::default(), &[]).unwrap());
        let proxy = RouteProxy::new(route, balancer, None, transport);
        let result = proxy.proxy(&req()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_healthy_backend_returns_no_backend_error() {
        let route = route();
        let backend = Backend::new("http://127.0.0.1:1".into(), 1);
        backend.mark_unhealthy();
        let balancer: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![backend]));
        let transport = Arc::new(TransportPool::new(Default::default(), &[]).unwrap());
        let proxy = RouteProxy::new(route, balancer, None, transport);
        let result = proxy.proxy(&req()).await;
        assert!(matches!(result, Err(GatewayError::NoBackend { .. })));
    }

    #[tokio::test]
    async fn ssrf_filter_blocks_dial_before_sending() {
        let route = route();
        let backend = Backend::new("http://127.0.0.1:1".into(), 1);
        let balancer: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![backend]));
        let transport_config = crate::models::settings::TransportConfig {
            ssrf_filter_enabled: true,
            ssrf_deny_cidrs: vec!["127.0.0.0/8".to_string()],
            ..Default::default()
        };
        let transport = Arc::new(TransportPool::new(transport_config, &[]).unwrap());
        let proxy = RouteProxy::new(route, balancer, None, transport);
        let result = proxy.proxy(&req()).await;
        match result {
            Err(GatewayError::Upstream { message }) => assert!(message.contains("SSRF")),
            other => panic!("expected an SSRF-blocked upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn adaptive_concurrency_sheds_once_limit_is_saturated() {
        let mut cfg = route();
        Arc::get_mut(&mut cfg).unwrap().adaptive_concurrency =
            crate::models::router::AdaptiveConcurrencySpec { enabled: true, initial_limit: 1, min_limit: 1, max_limit: 1, target_latency_ms: 50 };
        Arc::get_mut(&mut cfg).unwrap().timeout_policy = crate::models::router::TimeoutPolicy { per_attempt_ms: 5_000 };
        let backend_url = spawn_delayed_upstream(Duration::from_millis(200)).await;

        let backend = Backend::new(backend_url, 1);
        let balancer: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![backend]));
        let transport = Arc::new(TransportPool::new(Default::default(), &[]).unwrap());
        let proxy = RouteProxy::new(cfg, balancer, None, transport);

        let (req1, req2) = (req(), req());
        let (first, second) = tokio::join!(proxy.proxy(&req1), proxy.proxy(&req2));
        let results = [first, second];
        assert!(results.iter().any(|r| r.is_ok()));
        assert!(results.iter().any(|r| matches!(r, Err(GatewayError::Shedding))));
    }

    #[tokio::test]
    async fn outlier_detector_ejects_backend_after_consecutive_failures() {
        let route = route();
        let backend = Backend::new("http://127.0.0.1:1".into(), 1);
        let balancer: Arc<dyn Balancer> = Arc::new(RoundRobinBalancer::new(vec![backend]));
        let transport = Arc::new(TransportPool::new(Default::default(), &[]).unwrap());
        let proxy = RouteProxy::new(route, balancer, None, transport);

        for _ in 0..5 {
            assert!(proxy.proxy(&req()).await.is_err());
        }

        let result = proxy.proxy(&req()).await;
        assert!(matches!(result, Err(GatewayError::NoBackend { .. })), "expected backend ejected by outlier detector, got {result:?}");
    }

    /// An upstream that refuses to respond until `delay` has elapsed.
    async fn spawn_delayed_upstream(delay: Duration) -> String {
        use actix_web::{web, App, HttpResponse};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = actix_web::HttpServer::new(move || {
            App::new().default_service(web::route().to(move || async move {
                tokio::time::sleep(delay).await;
                HttpResponse::Ok().body("delayed-ok")
            }))
        })
        .listen(listener)
        .unwrap()
        .run();

        tokio::spawn(server);
        format!("http://{addr}")
    }
}
