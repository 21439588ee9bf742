//! Master configuration.
//!
//! ALL values are required - no defaults anywhere. Construction sites decide;
//! `validate()` enforces the bounds the runtime depends on.

use crate::error::{ConfigError, VellumError, VellumResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Master configuration struct for the analysis cache core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VellumConfig {
    /// Interval at which live workers refresh `last_heartbeat`.
    pub heartbeat_interval: Duration,

    /// Age past which a live task's heartbeat counts as stale. Must be a
    /// large multiple of `heartbeat_interval` so slow workers are not
    /// recovered by mistake.
    pub staleness_threshold: Duration,

    /// Internal retry bound for conflicting `upsert_pending` writes.
    pub upsert_retry_attempts: u32,

    /// Default `max_retries` stamped onto newly registered tasks.
    pub default_max_retries: i32,

    /// Default `max_attempts` for recovery queue entries.
    pub default_recovery_max_attempts: i32,

    /// Checkpoints retained per task before the oldest are dropped.
    pub checkpoint_retention: i32,

    /// Age past which terminal registry entries become prunable.
    pub task_retention: Duration,
}

impl VellumConfig {
    /// Minimum allowed ratio of staleness threshold to heartbeat interval.
    pub const MIN_STALENESS_FACTOR: u32 = 10;

    /// Validate the configuration.
    pub fn validate(&self) -> VellumResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "heartbeat_interval".to_string(),
                value: format!("{:?}", self.heartbeat_interval),
                reason: "heartbeat_interval must be positive".to_string(),
            }));
        }

        if self.staleness_threshold.is_zero() {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "staleness_threshold".to_string(),
                value: format!("{:?}", self.staleness_threshold),
                reason: "staleness_threshold must be positive".to_string(),
            }));
        }

        let floor = self.heartbeat_interval * Self::MIN_STALENESS_FACTOR;
        if self.staleness_threshold < floor {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "staleness_threshold".to_string(),
                value: format!("{:?}", self.staleness_threshold),
                reason: format!(
                    "staleness_threshold must be at least {}x heartbeat_interval ({:?})",
                    Self::MIN_STALENESS_FACTOR,
                    floor
                ),
            }));
        }

        if self.upsert_retry_attempts == 0 {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "upsert_retry_attempts".to_string(),
                value: self.upsert_retry_attempts.to_string(),
                reason: "upsert_retry_attempts must be at least 1".to_string(),
            }));
        }

        if self.default_max_retries < 0 {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "default_max_retries".to_string(),
                value: self.default_max_retries.to_string(),
                reason: "default_max_retries must be non-negative".to_string(),
            }));
        }

        if self.default_recovery_max_attempts <= 0 {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "default_recovery_max_attempts".to_string(),
                value: self.default_recovery_max_attempts.to_string(),
                reason: "default_recovery_max_attempts must be positive".to_string(),
            }));
        }

        if self.checkpoint_retention <= 0 {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "checkpoint_retention".to_string(),
                value: self.checkpoint_retention.to_string(),
                reason: "checkpoint_retention must be positive".to_string(),
            }));
        }

        if self.task_retention.is_zero() {
            return Err(VellumError::Config(ConfigError::InvalidValue {
                field: "task_retention".to_string(),
                value: format!("{:?}", self.task_retention),
                reason: "task_retention must be positive".to_string(),
            }));
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> VellumConfig {
        VellumConfig {
            heartbeat_interval: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(300),
            upsert_retry_attempts: 3,
            default_max_retries: 3,
            default_recovery_max_attempts: 3,
            checkpoint_retention: 20,
            task_retention: Duration::from_secs(86400 * 30),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let mut config = valid_config();
        config.heartbeat_interval = Duration::ZERO;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(VellumError::Config(ConfigError::InvalidValue { field, .. })) if field == "heartbeat_interval"
        ));
    }

    #[test]
    fn test_staleness_floor_enforced() {
        let mut config = valid_config();
        // 5s heartbeat needs >= 50s staleness; 30s is a false-positive trap.
        config.staleness_threshold = Duration::from_secs(30);
        let result = config.validate();
        assert!(matches!(
            result,
            Err(VellumError::Config(ConfigError::InvalidValue { field, .. })) if field == "staleness_threshold"
        ));
    }

    #[test]
    fn test_zero_upsert_retries_rejected() {
        let mut config = valid_config();
        config.upsert_retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nonpositive_recovery_attempts_rejected() {
        let mut config = valid_config();
        config.default_recovery_max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
