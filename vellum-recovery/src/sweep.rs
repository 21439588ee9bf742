//! Background sweep task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use vellum_storage::StorageTrait;

use crate::metrics::RecoveryMetrics;
use crate::orchestrator::RecoveryOrchestrator;

/// Background task that periodically runs the recovery sweep.
///
/// Runs until the shutdown signal is received. Each cycle discovers
/// stranded tasks, schedules recovery entries, and processes everything
/// due. Returns the metrics collected over the task's lifetime.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::watch;
/// use std::sync::Arc;
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let orchestrator = Arc::new(orchestrator);
///
/// let handle = tokio::spawn(async move {
///     recovery_sweep_task(orchestrator, shutdown_rx).await
/// });
///
/// // Later, trigger shutdown.
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await.unwrap();
/// ```
pub async fn recovery_sweep_task<S: StorageTrait>(
    orchestrator: Arc<RecoveryOrchestrator<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<RecoveryMetrics> {
    let mut sweep_interval = interval(orchestrator.config().sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = orchestrator.config().sweep_interval.as_secs(),
        staleness_secs = orchestrator.config().staleness_threshold.as_secs(),
        "Recovery sweep task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Recovery sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                let report = orchestrator.run_sweep_once(Utc::now());
                if report.discovered > 0 || report.processed > 0 {
                    tracing::info!(
                        discovered = report.discovered,
                        newly_orphaned = report.newly_orphaned,
                        scheduled = report.scheduled,
                        processed = report.processed,
                        "Recovery sweep cycle completed"
                    );
                } else {
                    tracing::trace!("Recovery sweep cycle completed with nothing to do");
                }
            }
        }
    }

    let metrics = orchestrator.metrics();
    let snapshot = metrics.snapshot();
    tracing::info!(
        tasks_discovered = snapshot.tasks_discovered,
        recoveries_succeeded = snapshot.recoveries_succeeded,
        recoveries_resolved = snapshot.recoveries_resolved,
        retries_exhausted = snapshot.retries_exhausted,
        sweep_cycles = snapshot.sweep_cycles,
        "Recovery sweep task completed"
    );
    metrics
}

// ============================================================================
// TESTS
// ============================================================================
