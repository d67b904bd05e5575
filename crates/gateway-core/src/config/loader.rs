//! Minimal JSON config loader, grounded in `kairos-rs::config::settings::load_settings`
//! (a `std::fs::read_to_string` + `serde_json::from_str` pair). The external
//! config-file-format parser itself is out of scope (spec.md Non-goals); this
//! crate only needs *a* concrete loader to exercise the core against.

use crate::models::settings::Config;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("config validation failed: {0}")]
    Invalid(String),
}

/// Reads and validates a [`Config`] from a JSON file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, LoadError> {
    let path_ref = path.as_ref();
    let path_str = path_ref.display().to_string();
    let raw = std::fs::read_to_string(path_ref).map_err(|source| LoadError::Io { path: path_str.clone(), source })?;
    load_from_str(&raw).map_err(|e| match e {
        LoadError::Parse { source, .. } => LoadError::Parse { path: path_str.clone(), source },
        other => other,
    })
}

/// Parses and validates a [`Config`] from a JSON string directly (used by
/// the reloader when re-reading a watched file, and by tests).
pub fn load_from_str(raw: &str) -> Result<Config, LoadError> {
    let config: Config = serde_json::from_str(raw).map_err(|source| LoadError::Parse { path: String::new(), source })?;
    config.validate().map_err(LoadError::Invalid)?;
    Ok(config)
}
