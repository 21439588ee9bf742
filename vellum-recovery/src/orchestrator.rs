//! Recovery orchestrator: discovery, validation, and bounded-retry recovery.
//!
//! The orchestrator re-arms registry state; actually re-executing the work
//! is the worker pool's job. A resumed task re-enters `Processing` carrying
//! the checkpoint's recoverable data, which is all a worker needs to pick
//! it up without redoing finished steps.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use vellum_core::{
    AnalysisStatus, Checkpoint, RecoveryMethod, RecoveryQueueEntry, RecoveryStatus,
    TaskRegistryEntry, TaskState, Timestamp, VellumError, VellumResult,
};
use vellum_storage::{RecoveryUpdate, StorageTrait};

use vellum_cache::AnalysisCache;
use vellum_tasks::{CheckpointLog, TaskRegistry, TransitionOptions};

use crate::config::RecoveryConfig;
use crate::metrics::RecoveryMetrics;

/// Summary of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks matching the discovery query this cycle.
    pub discovered: usize,
    /// Live tasks newly marked orphaned for a stale heartbeat.
    pub newly_orphaned: usize,
    /// Recovery queue entries created.
    pub scheduled: usize,
    /// Due queue entries processed.
    pub processed: usize,
}

/// The recovery orchestrator.
pub struct RecoveryOrchestrator<S: StorageTrait> {
    storage: Arc<S>,
    registry: TaskRegistry<S>,
    checkpoints: CheckpointLog<S>,
    cache: AnalysisCache<S>,
    config: RecoveryConfig,
    metrics: Arc<RecoveryMetrics>,
}

impl<S: StorageTrait> RecoveryOrchestrator<S> {
    pub fn new(
        storage: Arc<S>,
        registry: TaskRegistry<S>,
        checkpoints: CheckpointLog<S>,
        cache: AnalysisCache<S>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            checkpoints,
            cache,
            config,
            metrics: Arc::new(RecoveryMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<RecoveryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Open manual-intervention entries, for the operator queue.
    pub fn operator_queue(&self) -> VellumResult<Vec<RecoveryQueueEntry>> {
        self.storage.recovery_list_manual()
    }

    /// One full sweep cycle: discover stranded tasks, schedule recoveries,
    /// then process everything due. Synchronous so tests can drive time.
    pub fn run_sweep_once(&self, now: Timestamp) -> SweepReport {
        use std::sync::atomic::Ordering;

        self.metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);
        let mut report = SweepReport::default();

        let stale_before = now
            - ChronoDuration::from_std(self.config.staleness_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));

        let discovered = match self.storage.task_list_recoverable(stale_before) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "Failed to discover stranded tasks");
                self.metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                return report;
            }
        };

        report.discovered = discovered.len().min(self.config.batch_size);
        self.metrics
            .tasks_discovered
            .fetch_add(report.discovered as u64, Ordering::Relaxed);

        for task in discovered.into_iter().take(self.config.batch_size) {
            match self.quarantine_and_schedule(&task, now) {
                Ok((orphaned, scheduled)) => {
                    if orphaned {
                        report.newly_orphaned += 1;
                    }
                    if scheduled {
                        report.scheduled += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        task_id = %task.task_id,
                        "Failed to schedule recovery"
                    );
                    self.metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        report.processed = self.process_due(now);
        report
    }

    /// Mark a stale live task orphaned, then schedule a recovery entry if
    /// none is open. Returns (newly_orphaned, newly_scheduled).
    fn quarantine_and_schedule(
        &self,
        task: &TaskRegistryEntry,
        now: Timestamp,
    ) -> VellumResult<(bool, bool)> {
        let mut orphaned = false;

        if task.current_state.is_live() {
            match self.registry.transition(
                &task.task_id,
                TaskState::Orphaned,
                TransitionOptions::default().with_step("heartbeat stale"),
                now,
            ) {
                Ok(_) => {
                    orphaned = true;
                    if self.config.log_recoveries {
                        tracing::warn!(
                            task_id = %task.task_id,
                            state = %task.current_state,
                            last_heartbeat = %task.last_heartbeat,
                            "Task heartbeat stale, marked orphaned"
                        );
                    }
                }
                // The worker moved it between discovery and now - alive after all.
                Err(VellumError::Transition(_)) => {
                    tracing::debug!(
                        task_id = %task.task_id,
                        "Task already progressed, skipping quarantine"
                    );
                    return Ok((false, false));
                }
                Err(other) => return Err(other),
            }
        }

        if self
            .storage
            .recovery_find_open_for_task(&task.task_id)?
            .is_some()
        {
            return Ok((orphaned, false));
        }

        // Cross-sweep bound: every re-arm bumps the task's retry counter, so
        // a worker pool that never picks the task back up cannot keep it
        // cycling through recovery forever.
        if task.retry_count >= task.max_retries {
            self.fail_exhausted(&task.task_id, task.retry_count, now)?;
            return Ok((orphaned, false));
        }

        let method = if self.checkpoints.latest_valid(&task.task_id)?.is_some() {
            RecoveryMethod::ResumeCheckpoint
        } else {
            RecoveryMethod::RestartClean
        };

        let entry = RecoveryQueueEntry::new(
            task.task_id.clone(),
            method,
            now,
            self.config.max_attempts,
            now,
        );
        self.storage.recovery_insert(&entry)?;
        self.metrics
            .recoveries_scheduled
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        Ok((orphaned, true))
    }

    /// Process every due recovery queue entry. Returns the number handled.
    pub fn process_due(&self, now: Timestamp) -> usize {
        use std::sync::atomic::Ordering;

        let due = match self.storage.recovery_list_due(now) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list due recovery entries");
                self.metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };

        let mut processed = 0;
        for entry in due {
            // Manual entries wait for an operator; no automatic action.
            if entry.method == RecoveryMethod::ManualIntervention {
                continue;
            }
            if let Err(e) = self.handle_entry(&entry, now) {
                tracing::error!(
                    error = %e,
                    entry_id = %entry.entry_id,
                    task_id = %entry.task_id,
                    "Recovery attempt errored"
                );
                self.metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                let _ = self.reschedule(&entry, &e.to_string(), now);
            } else {
                processed += 1;
            }
        }
        processed
    }

    fn handle_entry(&self, entry: &RecoveryQueueEntry, now: Timestamp) -> VellumResult<()> {
        use std::sync::atomic::Ordering;

        let Some(task) = self.storage.task_get(&entry.task_id)? else {
            self.storage.recovery_update(
                entry.entry_id,
                RecoveryUpdate {
                    status: Some(RecoveryStatus::Failed),
                    last_error: Some("task no longer registered".to_string()),
                    ..Default::default()
                },
                now,
            )?;
            return Ok(());
        };

        // Validation before recovery: if the work already reached a terminal
        // state through some other path, resolve without side effects. This
        // is what prevents duplicate completion effects like double-charging.
        if self.try_resolve_completed(entry, &task, now)? {
            self.metrics
                .recoveries_resolved
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Bounded retry: exceeding the bound fails the task terminally
        // rather than looping forever.
        if entry.attempts >= entry.max_attempts {
            return self.exhaust(entry, &task, now);
        }

        self.storage.recovery_update(
            entry.entry_id,
            RecoveryUpdate {
                status: Some(RecoveryStatus::InProgress),
                bump_attempt: true,
                ..Default::default()
            },
            now,
        )?;

        let outcome = match entry.method {
            RecoveryMethod::ResumeCheckpoint => self.resume_from_checkpoint(&task, now),
            RecoveryMethod::RestartClean => self.restart_clean(&task, now),
            RecoveryMethod::ValidateOnly => {
                // Completion was just re-verified above and was absent.
                self.storage.recovery_update(
                    entry.entry_id,
                    RecoveryUpdate {
                        status: Some(RecoveryStatus::Failed),
                        last_error: Some("validation found task incomplete".to_string()),
                        ..Default::default()
                    },
                    now,
                )?;
                return Ok(());
            }
            RecoveryMethod::ManualIntervention => return Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.storage.recovery_update(
                    entry.entry_id,
                    RecoveryUpdate {
                        status: Some(RecoveryStatus::Succeeded),
                        ..Default::default()
                    },
                    now,
                )?;
                self.metrics
                    .recoveries_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                if self.config.log_recoveries {
                    tracing::info!(
                        task_id = %task.task_id,
                        method = %entry.method,
                        attempt = entry.attempts + 1,
                        "Task recovery succeeded"
                    );
                }
                Ok(())
            }
            // The task moved under us - a worker is alive after all.
            Err(VellumError::Transition(_)) => {
                tracing::debug!(
                    task_id = %task.task_id,
                    "Task already progressed, resolving recovery entry"
                );
                self.storage.recovery_update(
                    entry.entry_id,
                    RecoveryUpdate {
                        status: Some(RecoveryStatus::Resolved),
                        ..Default::default()
                    },
                    now,
                )?;
                self.metrics
                    .recoveries_resolved
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(other) => {
                self.metrics
                    .recoveries_failed
                    .fetch_add(1, Ordering::Relaxed);
                self.reschedule(entry, &other.to_string(), now)
            }
        }
    }

    /// Resolve the entry when the task or its analysis already completed.
    /// Returns true when resolved.
    fn try_resolve_completed(
        &self,
        entry: &RecoveryQueueEntry,
        task: &TaskRegistryEntry,
        now: Timestamp,
    ) -> VellumResult<bool> {
        let mut completed_result: Option<serde_json::Value> = None;
        let mut completed = task.current_state.is_terminal();

        if !completed {
            if let Some(key) = &task.analysis_key {
                if let Some(analysis) = self.cache.get(key)? {
                    if analysis.status == AnalysisStatus::Completed {
                        completed = true;
                        completed_result = analysis.result;
                    }
                }
            }
        }

        if !completed {
            return Ok(false);
        }

        self.storage.recovery_update(
            entry.entry_id,
            RecoveryUpdate {
                status: Some(RecoveryStatus::Resolved),
                ..Default::default()
            },
            now,
        )?;

        // A stranded task whose analysis finished elsewhere is closed out so
        // the sweep stops rediscovering it. Pure bookkeeping - no completion
        // side effects are re-run.
        if !task.current_state.is_terminal() {
            let mut opts =
                TransitionOptions::default().with_step("completed through another path");
            if let Some(result) = completed_result {
                opts = opts.with_result(result);
            }
            match self
                .registry
                .transition(&task.task_id, TaskState::Completed, opts, now)
            {
                Ok(_) | Err(VellumError::Transition(_)) => {}
                Err(other) => return Err(other),
            }
        }

        if self.config.log_recoveries {
            tracing::info!(
                task_id = %task.task_id,
                "Recovery skipped, work already completed elsewhere"
            );
        }
        Ok(true)
    }

    fn exhaust(
        &self,
        entry: &RecoveryQueueEntry,
        task: &TaskRegistryEntry,
        now: Timestamp,
    ) -> VellumResult<()> {
        self.storage.recovery_update(
            entry.entry_id,
            RecoveryUpdate {
                status: Some(RecoveryStatus::Failed),
                last_error: Some(format!(
                    "recovery attempt bound exceeded ({}/{})",
                    entry.attempts, entry.max_attempts
                )),
                ..Default::default()
            },
            now,
        )?;
        self.fail_exhausted(&task.task_id, entry.attempts, now)
    }

    /// Transition a task to terminal failure with a retry-exhausted error.
    fn fail_exhausted(&self, task_id: &str, attempts: i32, now: Timestamp) -> VellumResult<()> {
        use std::sync::atomic::Ordering;

        let error = vellum_core::RecoveryError::RetryExhausted {
            task_id: task_id.to_string(),
            attempts,
        };
        match self.registry.transition(
            task_id,
            TaskState::Failed,
            TransitionOptions::default()
                .with_error(error.to_string())
                .with_step("recovery retries exhausted"),
            now,
        ) {
            Ok(_) | Err(VellumError::Transition(_)) => {}
            Err(other) => return Err(other),
        }

        self.metrics.retries_exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            task_id = %task_id,
            attempts,
            "Recovery retries exhausted, task failed terminally"
        );
        Ok(())
    }

    /// Resume from the latest valid checkpoint, falling back to a clean
    /// restart when no checkpoint verifies.
    fn resume_from_checkpoint(
        &self,
        task: &TaskRegistryEntry,
        now: Timestamp,
    ) -> VellumResult<()> {
        match self.checkpoints.latest_valid(&task.task_id)? {
            Some(checkpoint) => self.rearm(task, Some(checkpoint), now),
            None => {
                // Integrity failures surfaced between scheduling and now.
                self.metrics
                    .integrity_fallbacks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(
                    task_id = %task.task_id,
                    "No valid checkpoint, falling back to clean restart"
                );
                self.restart_clean(task, now)
            }
        }
    }

    /// Discard checkpoints and re-arm the task from scratch.
    fn restart_clean(&self, task: &TaskRegistryEntry, now: Timestamp) -> VellumResult<()> {
        self.checkpoints.discard_all(&task.task_id)?;
        self.rearm(task, None, now)
    }

    /// Move a stranded task back into processing, carrying the checkpoint's
    /// recoverable data when resuming.
    fn rearm(
        &self,
        task: &TaskRegistryEntry,
        checkpoint: Option<Checkpoint>,
        now: Timestamp,
    ) -> VellumResult<()> {
        let mut recovering = TransitionOptions::default().with_step("recovery started");
        recovering.bump_retry = true;
        self.registry
            .transition(&task.task_id, TaskState::Recovering, recovering, now)?;

        let processing = match checkpoint {
            Some(checkpoint) => TransitionOptions::progress(checkpoint.progress_percent)
                .with_checkpoint_data(checkpoint.recoverable_data.clone())
                .with_step(format!("resumed from checkpoint {}", checkpoint.name)),
            None => TransitionOptions::progress(0.0)
                .with_checkpoint_data(serde_json::Value::Null)
                .with_step("restarted clean"),
        };
        self.registry
            .transition(&task.task_id, TaskState::Processing, processing, now)?;
        Ok(())
    }

    fn reschedule(
        &self,
        entry: &RecoveryQueueEntry,
        error: &str,
        now: Timestamp,
    ) -> VellumResult<()> {
        let backoff = ChronoDuration::from_std(self.config.retry_backoff)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        self.storage.recovery_update(
            entry.entry_id,
            RecoveryUpdate {
                status: Some(RecoveryStatus::Scheduled),
                last_error: Some(error.to_string()),
                reschedule_for: Some(now + backoff),
                ..Default::default()
            },
            now,
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
