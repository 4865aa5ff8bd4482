use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "FETCHFLEET_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/fetchfleet.toml";
const ENV_PREFIX: &str = "FETCHFLEET";
const ENV_SEPARATOR: &str = "__";
const API_KEYS_ENV_VAR: &str = "FETCHFLEET_API_KEYS";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    load_with_path(None)
}

/// Same as [`load`], but an explicit `config_path` beats `FETCHFLEET_CONFIG`
pub fn load_with_path(config_path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = config_path.unwrap_or_else(|| {
        env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    });

    let mut config = load_from_sources(config_path)?;

    load_secrets(&mut config);

    Ok(config)
}

/// Load secrets from environment variables into config
/// Secrets are never stored in TOML files, only in environment
fn load_secrets(config: &mut Config) {
    if let Ok(keys) = env::var(API_KEYS_ENV_VAR) {
        config.security.api_keys = parse_api_keys(&keys);
    }
}

/// Split a comma-separated key list, dropping blanks
fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // FETCHFLEET__ASSIGNMENT__STRATEGY -> assignment.strategy
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
