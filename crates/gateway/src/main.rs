//! Gateway server binary.
//!
//! High-performance HTTP API gateway built with Rust and Actix Web. This
//! binary loads a route configuration, builds the initial generation, starts
//! the server, and polls the config file for changes to hot-reload without
//! a restart.

use gateway_core::config::loader::load_from_path;
use gateway_core::dispatcher::dispatch;
use gateway_core::logs::logger::configure_logger;
use gateway_core::reloader::Reloader;

use actix_web::{web, App, HttpServer};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());

    let config = load_from_path(&config_path).unwrap_or_else(|e| {
        error!("failed to load configuration from {config_path}: {e}");
        std::process::exit(1);
    });

    info!("starting gateway with {} route(s) from {config_path}", config.routes.len());

    let reloader = Arc::new(Reloader::new(&config).unwrap_or_else(|e| {
        error!("failed to build initial generation: {e}");
        std::process::exit(1);
    }));

    tokio::spawn(poll_for_reload(reloader.clone(), config_path));

    let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("GATEWAY_PORT").unwrap_or_else(|_| "5900".to_string()).parse::<u16>().unwrap_or(5900);

    info!("listening on {host}:{port}");

    let server = HttpServer::new({
        let reloader = reloader.clone();
        move || {
            App::new()
                .app_data(web::Data::new(reloader.clone()))
                .wrap(actix_web::middleware::Compress::default())
                .default_service(web::route().to(dispatch))
        }
    })
    .bind((host.as_str(), port))?
    .run();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped gracefully"),
                Err(e) => error!("server error: {e}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, stopping server...");
        }
    }

    Ok(())
}

/// Polls the config file on an interval and publishes a new generation when
/// it parses and validates; a bad edit is logged and left for the next poll,
/// the previous generation keeps serving in the meantime (§4.7).
async fn poll_for_reload(reloader: Arc<Reloader>, config_path: String) {
    let mut interval = tokio::time::interval(RELOAD_POLL_INTERVAL);
    let mut last_modified = std::fs::metadata(&config_path).and_then(|m| m.modified()).ok();

    loop {
        interval.tick().await;

        let modified = match std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!("could not stat config file {config_path}: {e}");
                continue;
            }
        };
        if last_modified == Some(modified) {
            continue;
        }
        last_modified = Some(modified);

        match load_from_path(&config_path) {
            Ok(config) => match reloader.reload(&config) {
                Ok(()) => info!("reloaded configuration from {config_path}"),
                Err(e) => error!("rejected reload from {config_path}: {e}"),
            },
            Err(e) => error!("failed to parse {config_path} during reload: {e}"),
        }
    }
}
