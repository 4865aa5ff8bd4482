//! Configuration management for fetchfleet
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use fetchfleet::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Dispatcher listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `FETCHFLEET__<section>__<key>`
//!
//! Examples:
//! - `FETCHFLEET__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `FETCHFLEET__ASSIGNMENT__STRATEGY=round_robin`
//! - `FETCHFLEET__WORKERS__HEARTBEAT_TIMEOUT=2m`
//!
//! API keys are secrets and are read only from `FETCHFLEET_API_KEYS`
//! (comma-separated).
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/fetchfleet.toml`.
//! This can be overridden using the `FETCHFLEET_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{
    AssignmentConfig, Config, CorsConfig, SecurityConfig, ServerConfig, StorageBackendKind,
    StorageConfig, TelemetryConfig, WorkerManagementConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`FETCHFLEET__*`)
    /// 2. TOML file (default: `config/fetchfleet.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (inconsistent timeouts, zero capacity, etc.)
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Like [`Config::load`] with the file location given on the command line
    pub fn load_with_path(path: Option<std::path::PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load_with_path(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
