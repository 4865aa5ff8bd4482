use super::models::{Config, StorageBackendKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("heartbeat_timeout ({timeout}) must be longer than heartbeat_interval ({interval})")]
    HeartbeatTimeoutTooShort { timeout: String, interval: String },

    #[error("offline_threshold ({threshold}) must not be shorter than heartbeat_timeout ({timeout})")]
    OfflineThresholdTooShort { threshold: String, timeout: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("busy_threshold_percent must be between 1 and 100, got {0}")]
    InvalidBusyThreshold(u8),

    #[error("default_total_slots must be greater than zero")]
    NoDefaultSlots,

    #[error("rpc_failure_threshold must be greater than zero")]
    InvalidRpcFailureThreshold,

    #[error("Storage backend is fjall but no path is configured")]
    MissingStoragePath,

    #[error("max_payload_bytes must be greater than zero")]
    InvalidPayloadLimit,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_worker_timing(config)?;
    validate_capacity(config)?;
    validate_storage(config)?;
    validate_server(config)?;
    Ok(())
}

/// Heartbeat interval < timeout <= offline threshold
fn validate_worker_timing(config: &Config) -> Result<(), ValidationError> {
    let workers = &config.workers;

    if workers.heartbeat_interval.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "heartbeat_interval",
        });
    }

    if config.assignment.schedule_interval.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "schedule_interval",
        });
    }

    if workers.rpc_timeout.as_duration().is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "rpc_timeout",
        });
    }

    if workers.heartbeat_timeout <= workers.heartbeat_interval {
        return Err(ValidationError::HeartbeatTimeoutTooShort {
            timeout: workers.heartbeat_timeout.to_string(),
            interval: workers.heartbeat_interval.to_string(),
        });
    }

    if workers.offline_threshold < workers.heartbeat_timeout {
        return Err(ValidationError::OfflineThresholdTooShort {
            threshold: workers.offline_threshold.to_string(),
            timeout: workers.heartbeat_timeout.to_string(),
        });
    }

    Ok(())
}

fn validate_capacity(config: &Config) -> Result<(), ValidationError> {
    let workers = &config.workers;

    if !(1..=100).contains(&workers.busy_threshold_percent) {
        return Err(ValidationError::InvalidBusyThreshold(
            workers.busy_threshold_percent,
        ));
    }

    if workers.default_total_slots == 0 {
        return Err(ValidationError::NoDefaultSlots);
    }

    if workers.rpc_failure_threshold == 0 {
        return Err(ValidationError::InvalidRpcFailureThreshold);
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.backend == StorageBackendKind::Fjall
        && config.storage.path.as_os_str().is_empty()
    {
        return Err(ValidationError::MissingStoragePath);
    }
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    if config.server.max_payload_bytes == 0 {
        return Err(ValidationError::InvalidPayloadLimit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::HumanDuration;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let mut config = Config::default();
        config.workers.heartbeat_timeout = HumanDuration::from_secs(30);

        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ValidationError::HeartbeatTimeoutTooShort { .. }));
    }

    #[test]
    fn test_offline_threshold_below_timeout() {
        let mut config = Config::default();
        config.workers.offline_threshold = HumanDuration::from_secs(60);

        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ValidationError::OfflineThresholdTooShort { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.workers.heartbeat_interval = HumanDuration::from_secs(0);

        let err = validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ZeroDuration {
                field: "heartbeat_interval"
            }
        ));
    }

    #[test]
    fn test_busy_threshold_bounds() {
        let mut config = Config::default();
        config.workers.busy_threshold_percent = 0;
        assert!(matches!(
            validate(&config).unwrap_err(),
            ValidationError::InvalidBusyThreshold(0)
        ));

        config.workers.busy_threshold_percent = 101;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_fjall_requires_path() {
        let mut config = Config::default();
        config.storage.backend = StorageBackendKind::Fjall;
        config.storage.path = PathBuf::new();

        assert!(matches!(
            validate(&config).unwrap_err(),
            ValidationError::MissingStoragePath
        ));
    }

    #[test]
    fn test_required_keys_without_keys_is_allowed() {
        let mut config = Config::default();
        config.security.api_key_required = true;
        assert!(validate(&config).is_ok());
    }
}
