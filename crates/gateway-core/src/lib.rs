//! Core routing, load balancing, and resilience engine for the gateway.
//!
//! - [`config`] — configuration loading.
//! - [`dispatcher`] — actix-web entry point: request → route match → handler.
//! - [`logs`] — structured logging setup.
//! - [`middleware`] — canonical stage chain and stage implementations.
//! - [`models`] — configuration, error, and per-request context types.
//! - [`reloader`] — atomically-swapped route table + handler generations.
//! - [`services`] — backends, balancers, transport, resilience primitives.
//! - [`utils`] — route compilation and backend URL construction.

pub mod config;
pub mod dispatcher;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod reloader;
pub mod services;
pub mod utils;
