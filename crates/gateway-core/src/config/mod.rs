//! Configuration loading: turns a JSON file on disk into a validated
//! [`crate::models::settings::Config`] the [`crate::reloader::Reloader`] can
//! publish.

pub mod loader;
