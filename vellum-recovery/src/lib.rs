//! VELLUM Recovery - Crash Recovery Orchestration
//!
//! A periodic sweep that finds tasks whose heartbeat went stale without a
//! terminal transition, schedules them into a bounded-retry recovery queue,
//! and resumes them from their latest valid checkpoint. Tasks can become
//! stranded when:
//!
//! - A worker crashes without completing or failing its task
//! - Network partitions prevent completion notifications
//! - Bugs in worker code prevent proper state transitions
//!
//! Before resuming, the orchestrator re-checks whether the work already
//! reached completion through some other path; if so the queue entry is
//! marked resolved and no side effects are performed. Exceeding the attempt
//! bound fails the task terminally instead of looping forever.

mod config;
mod metrics;
mod orchestrator;
mod sweep;

pub use config::RecoveryConfig;
pub use metrics::{RecoveryMetrics, RecoverySnapshot};
pub use orchestrator::{RecoveryOrchestrator, SweepReport};
pub use sweep::recovery_sweep_task;
