//! Recovery sweep metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking recovery activity since startup.
#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    /// Tasks found with stale heartbeats or stranded states.
    pub tasks_discovered: AtomicU64,

    /// Recovery queue entries scheduled.
    pub recoveries_scheduled: AtomicU64,

    /// Recovery attempts that resumed or restarted a task.
    pub recoveries_succeeded: AtomicU64,

    /// Entries resolved because the work completed through another path.
    pub recoveries_resolved: AtomicU64,

    /// Recovery attempts that failed and were rescheduled.
    pub recoveries_failed: AtomicU64,

    /// Tasks failed terminally after exhausting the attempt bound.
    pub retries_exhausted: AtomicU64,

    /// Checkpoint integrity failures that forced a clean restart.
    pub integrity_fallbacks: AtomicU64,

    /// Total sweep cycles completed.
    pub sweep_cycles: AtomicU64,

    /// Errors encountered during sweeps.
    pub sweep_errors: AtomicU64,
}

impl RecoveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of all counters.
    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            tasks_discovered: self.tasks_discovered.load(Ordering::Relaxed),
            recoveries_scheduled: self.recoveries_scheduled.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_resolved: self.recoveries_resolved.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            integrity_fallbacks: self.integrity_fallbacks.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the recovery counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub tasks_discovered: u64,
    pub recoveries_scheduled: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_resolved: u64,
    pub recoveries_failed: u64,
    pub retries_exhausted: u64,
    pub integrity_fallbacks: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}
