//! Recovery sweep configuration.

use std::time::Duration;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALENESS_SECS: u64 = 300;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 60;

/// Configuration for the recovery sweep.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often the sweep runs (default: 60 seconds).
    pub sweep_interval: Duration,

    /// Heartbeat age past which a live task counts as stalled. Must be a
    /// large multiple of the worker heartbeat interval so merely slow
    /// workers are not recovered by mistake (default: 5 minutes).
    pub staleness_threshold: Duration,

    /// Maximum stranded tasks scheduled per sweep cycle (default: 100).
    pub batch_size: usize,

    /// Attempt bound for each recovery queue entry (default: 3).
    pub max_attempts: i32,

    /// Delay before a failed recovery attempt is rescheduled (default: 60s).
    pub retry_backoff: Duration,

    /// Whether to log each recovered task (default: true).
    pub log_recoveries: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            staleness_threshold: Duration::from_secs(DEFAULT_STALENESS_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            log_recoveries: true,
        }
    }
}

impl RecoveryConfig {
    /// Create RecoveryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `VELLUM_RECOVERY_SWEEP_INTERVAL_SECS`: sweep cadence (default: 60)
    /// - `VELLUM_RECOVERY_STALENESS_SECS`: heartbeat staleness threshold (default: 300)
    /// - `VELLUM_RECOVERY_BATCH_SIZE`: max tasks per cycle (default: 100)
    /// - `VELLUM_RECOVERY_MAX_ATTEMPTS`: attempt bound per entry (default: 3)
    /// - `VELLUM_RECOVERY_RETRY_BACKOFF_SECS`: reschedule delay (default: 60)
    /// - `VELLUM_RECOVERY_LOG`: whether to log recoveries (default: true)
    pub fn from_env() -> Self {
        let sweep_interval = Duration::from_secs(
            std::env::var("VELLUM_RECOVERY_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let staleness_threshold = Duration::from_secs(
            std::env::var("VELLUM_RECOVERY_STALENESS_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STALENESS_SECS),
        );

        let batch_size = std::env::var("VELLUM_RECOVERY_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let max_attempts = std::env::var("VELLUM_RECOVERY_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let retry_backoff = Duration::from_secs(
            std::env::var("VELLUM_RECOVERY_RETRY_BACKOFF_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS),
        );

        let log_recoveries = std::env::var("VELLUM_RECOVERY_LOG")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            sweep_interval,
            staleness_threshold,
            batch_size,
            max_attempts,
            retry_backoff,
            log_recoveries,
        }
    }

    /// Configuration for development/testing with short timeouts.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(60),
            batch_size: 10,
            max_attempts: 2,
            retry_backoff: Duration::from_secs(5),
            log_recoveries: true,
        }
    }

    /// Configuration for production with conservative thresholds.
    pub fn production() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            staleness_threshold: Duration::from_secs(600), // 10 minutes
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: 5,
            retry_backoff: Duration::from_secs(120),
            log_recoveries: true,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
