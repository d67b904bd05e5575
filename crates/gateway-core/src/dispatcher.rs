//! Dispatcher: the actix-web entry point that converts an `HttpRequest` into
//! a [`ProxyRequest`], matches it against the current [`Generation`]'s route
//! table, runs the matched route's composed handler, and converts the
//! outcome back into an `HttpResponse` (§4.1's request lifecycle, steps
//! "match" through "respond").
//!
//! Generalizes `kairos-rs::services::http::RouteHandler::handle`, which took
//! an `HttpRequest` straight off actix's router and proxied it inline. Here,
//! matching is decoupled from proxying: the [`crate::utils::route_table::RouteTable`]
//! owns match selection, [`crate::middleware::chain`] owns the request's
//! pipeline, and this module is just the wire-format boundary between them
//! and actix.

use crate::middleware::chain::Handler;
use crate::models::context::VariableContext;
use crate::models::error::GatewayError;
use crate::reloader::{Generation, Reloader};
use crate::services::route_proxy::{ProxyRequest, ProxyResponse};
use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse, ResponseError};
use std::sync::Arc;

/// Handles one inbound request against `reloader`'s current generation.
pub async fn dispatch(reloader: web::Data<Arc<Reloader>>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let generation = reloader.current();
    dispatch_against(&generation, req, body).await
}

async fn dispatch_against(generation: &Generation, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let proxy_req = build_proxy_request(&req, body);

    let header_pairs = proxy_req.headers.clone();
    let query_pairs: Vec<(String, String)> = url::form_urlencoded::parse(proxy_req.query.as_bytes()).into_owned().collect();
    let host = header_pairs.iter().find(|(name, _)| name.eq_ignore_ascii_case("host")).map(|(_, value)| value.as_str());

    let matched = generation.table.find_match(&proxy_req.method, host, &proxy_req.path, &header_pairs, &query_pairs);

    let Some(matched) = matched else {
        return GatewayError::NoRoute { path: proxy_req.path.clone() }.error_response();
    };

    // A route can match in the table but have no handler if it was dropped
    // between building the table and the handler map during a reload race
    // (§4.6 step 5) — that's a config-consistency fault, not a routing miss,
    // so it surfaces as 500 rather than 404.
    let Some(handler) = generation.handlers.get(&matched.route.id) else {
        return GatewayError::Config { route: matched.route.id.clone(), message: "route matched but has no handler".into() }.error_response();
    };
    let handler: Handler = handler.clone();

    let mut ctx = VariableContext::new(uuid::Uuid::new_v4().to_string());
    ctx.path_params = matched.path_params;
    ctx.route_id = Some(matched.route.id.clone());

    match handler(ctx, proxy_req).await {
        Ok(response) => proxy_response_into_http(response),
        Err(err) => err.error_response(),
    }
}

fn build_proxy_request(req: &HttpRequest, body: web::Bytes) -> ProxyRequest {
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();

    let query = req.query_string().to_string();

    let cookies: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim().to_string();
            let value = parts.next()?.trim().to_string();
            if name.is_empty() {
                None
            } else {
                Some((name, value))
            }
        })
        .collect();

    let idempotency_key_present = headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("idempotency-key"));
    let remote_addr = req.peer_addr().map(|addr| addr.ip().to_string());

    ProxyRequest {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query,
        headers,
        cookies,
        body: bytes::Bytes::from(body.to_vec()),
        remote_addr,
        idempotency_key_present,
    }
}

fn proxy_response_into_http(response: ProxyResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    for cookie in &response.set_cookies {
        builder.insert_header(("Set-Cookie", cookie.as_str()));
    }
    builder.body(response.body)
}
