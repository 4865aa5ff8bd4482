use crate::humanize::HumanDuration;
use crate::scheduler::Strategy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub workers: WorkerManagementConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Upper bound on request bodies, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024 // 1 MB
}

/// Persistence backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Fjall,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Keyspace directory for the fjall backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/dispatcher")
}

/// Task assignment and retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssignmentConfig {
    #[serde(default)]
    pub strategy: Strategy,
    /// Reassignment attempts before a task is failed for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait after a failure before a recycled task is eligible again
    #[serde(default = "default_retry_delay")]
    pub retry_delay: HumanDuration,
    /// How often pending tasks are offered to the assignment engine
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval: HumanDuration,
    /// Reclaim `assigned` tasks that never started; disabled when unset
    #[serde(default)]
    pub stuck_task_timeout: Option<HumanDuration>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            schedule_interval: default_schedule_interval(),
            stuck_task_timeout: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_schedule_interval() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Worker liveness and capacity policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerManagementConfig {
    /// Supervisor sweep period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: HumanDuration,
    /// Silence after which a worker is marked offline
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: HumanDuration,
    #[serde(default = "default_true")]
    pub auto_remove_offline: bool,
    /// Silence after which an offline worker is removed
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: HumanDuration,
    /// Load at or above which an online worker is reported busy
    #[serde(default = "default_busy_threshold_percent")]
    pub busy_threshold_percent: u8,
    /// Consecutive RPC failures that put a worker into the error state
    #[serde(default = "default_rpc_failure_threshold")]
    pub rpc_failure_threshold: u32,
    /// Bound on every call to a worker's local RPC surface
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: HumanDuration,
    /// Slots assumed for workers that register without a count
    #[serde(default = "default_total_slots")]
    pub default_total_slots: u32,
}

impl Default for WorkerManagementConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            auto_remove_offline: true,
            offline_threshold: default_offline_threshold(),
            busy_threshold_percent: default_busy_threshold_percent(),
            rpc_failure_threshold: default_rpc_failure_threshold(),
            rpc_timeout: default_rpc_timeout(),
            default_total_slots: default_total_slots(),
        }
    }
}

fn default_heartbeat_interval() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_heartbeat_timeout() -> HumanDuration {
    HumanDuration::from_secs(90)
}

fn default_true() -> bool {
    true
}

fn default_offline_threshold() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_busy_threshold_percent() -> u8 {
    100
}

fn default_rpc_failure_threshold() -> u32 {
    3
}

fn default_rpc_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_total_slots() -> u32 {
    5
}

/// API key filter settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_key_required: bool,
    /// Accepted keys (loaded from environment, not from config file)
    #[serde(skip)]
    pub api_keys: Vec<String>,
}

impl SecurityConfig {
    /// Requests must carry one of the configured keys
    pub fn enforces_keys(&self) -> bool {
        self.api_key_required && !self.api_keys.is_empty()
    }

    /// Keys are required but none are configured, so every request passes
    pub fn is_misconfigured(&self) -> bool {
        self.api_key_required && self.api_keys.is_empty()
    }
}

/// Cross-origin settings for the browser dashboard
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8080".to_string()]
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8000");
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.assignment.strategy, Strategy::LeastLoaded);
        assert_eq!(config.assignment.max_retries, 3);
        assert_eq!(config.assignment.retry_delay.as_duration(), Duration::from_secs(300));
        assert_eq!(config.workers.heartbeat_timeout.as_duration(), Duration::from_secs(90));
        assert!(config.workers.auto_remove_offline);
        assert_eq!(config.workers.default_total_slots, 5);
        assert!(!config.security.api_key_required);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[assignment]
strategy = "round_robin"
retry_delay = "10s"

[workers]
heartbeat_timeout = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.assignment.strategy, Strategy::RoundRobin);
        assert_eq!(config.assignment.retry_delay.as_duration(), Duration::from_secs(10));
        assert_eq!(config.assignment.max_retries, 3);
        assert_eq!(config.workers.heartbeat_timeout.as_duration(), Duration::from_secs(45));
        assert_eq!(config.workers.heartbeat_interval.as_duration(), Duration::from_secs(30));
    }
}
