//! Gateway error taxonomy (§7) with its HTTP response mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Every error a request can fail with, spanning routing, admission,
/// upstream availability/timing, validation, payload, and internal faults.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no route matches path {path}")]
    NoRoute { path: String },

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("unauthenticated")]
    Unauthenticated { schemes: Vec<String> },

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("admission queue full")]
    QueueFull,

    #[error("request shed under load")]
    Shedding,

    #[error("no healthy backend for route {route}")]
    NoBackend { route: String },

    #[error("circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("all retry attempts exhausted against {route}")]
    AllRetriesExhausted { route: String },

    #[error("upstream timed out after {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64 },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("schema violation: {message}")]
    SchemaViolation { message: String },

    #[error("payload too large (limit {limit_bytes} bytes)")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("upstream error: {message}")]
    Upstream { message: String },

    #[error("route configuration error in {route}: {message}")]
    Config { route: String, message: String },
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
    message: String,
    request_id: String,
}

impl GatewayError {
    /// Stable machine-readable kind used in the wire envelope and, for gRPC
    /// routes, mapped to a `Grpc-Status` code by the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoRoute { .. } => "no_route",
            GatewayError::MethodNotAllowed { .. } => "no_route",
            GatewayError::Unauthenticated { .. } => "unauthenticated",
            GatewayError::Forbidden => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::QuotaExceeded => "quota_exceeded",
            GatewayError::QueueFull => "queue_full",
            GatewayError::Shedding => "shedding",
            GatewayError::NoBackend { .. } => "no_backend",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::AllRetriesExhausted { .. } => "all_retries_exhausted",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::SchemaViolation { .. } => "schema_violation",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::Internal { .. } => "panic",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Config { .. } => "config_race",
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::CircuitOpen { .. } | GatewayError::QueueFull | GatewayError::Shedding => {
                Some(1)
            }
            _ => None,
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute { .. } | GatewayError::MethodNotAllowed { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::QueueFull | GatewayError::Shedding => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoBackend { .. }
            | GatewayError::CircuitOpen { .. }
            | GatewayError::AllRetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest { .. } | GatewayError::SchemaViolation { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal { .. } | GatewayError::Config { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut builder = HttpResponse::build(self.status_code());
        if let Some(secs) = self.retry_after_secs() {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        if let GatewayError::Unauthenticated { schemes } = self {
            let value = if schemes.is_empty() {
                "Bearer".to_string()
            } else {
                schemes.join(", ")
            };
            builder.insert_header(("WWW-Authenticate", value));
        }
        builder.json(ErrorEnvelope {
            error: self.kind(),
            message: self.to_string(),
            request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backend_maps_to_503() {
        let err = GatewayError::NoBackend { route: "r1".into() };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), "no_backend");
    }

    #[test]
    fn no_route_maps_to_404() {
        let err = GatewayError::NoRoute { path: "/x".into() };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = GatewayError::RateLimited { retry_after_secs: 5 };
        assert_eq!(err.retry_after_secs(), Some(5));
    }
}
