//! VELLUM Engine - Collaborator Facade
//!
//! The single entry point the surrounding application talks to. Upstream
//! collaborators (ingestion, web tier) hand in content hashes and user ids;
//! downstream collaborators (workers) drive tasks through the registry and
//! report results. Every read composes the access gate with the shared
//! cache in application code - there are no cross-cutting storage views,
//! so the gate stays the one authorization chokepoint.

use std::sync::Arc;

use vellum_core::{
    AnalysisKey, AnalysisStatus, Checkpoint, ContentHash, EntityId, PossessionRecord,
    PossessionSource, StorageError, TaskId, TaskState, Timestamp, TransitionError, UserId,
    VellumConfig, VellumError, VellumResult,
};
use vellum_storage::StorageTrait;

use vellum_cache::{AccessGate, AnalysisCache, ContentStore, PossessionLedger, Principal};
use vellum_tasks::{CheckpointLog, NewTask, ProgressSink, TaskRegistry, TransitionOptions};

/// Outcome of `request_analysis`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequestOutcome {
    /// Whether a completed result already existed for this content.
    pub cache_hit: bool,
    pub analysis_id: EntityId,
    /// The producing task: newly scheduled on a miss, the in-flight one
    /// when adopting, absent on a hit.
    pub task_id: Option<TaskId>,
}

/// Outcome of `get_result`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// The shared result, readable because the caller holds possession.
    Ready {
        analysis_id: EntityId,
        result: serde_json::Value,
    },
    /// Not computed yet (or suppressed for this caller). `status` is the
    /// caller's view: their own cancellation shows here even while the
    /// shared computation keeps running for other possessors.
    NotReady {
        status: AnalysisStatus,
        progress_percent: f32,
        error: Option<String>,
    },
}

impl AnalysisOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, AnalysisOutcome::Ready { .. })
    }
}

/// The engine facade.
pub struct Engine<S: StorageTrait> {
    config: VellumConfig,
    content: ContentStore<S>,
    cache: AnalysisCache<S>,
    ledger: PossessionLedger<S>,
    gate: AccessGate<S>,
    registry: TaskRegistry<S>,
    checkpoints: CheckpointLog<S>,
}

impl<S: StorageTrait> Engine<S> {
    /// Build an engine over a storage backend. Validates the configuration.
    pub fn new(storage: Arc<S>, config: VellumConfig) -> VellumResult<Self> {
        config.validate()?;
        let ledger = PossessionLedger::new(Arc::clone(&storage));
        Ok(Self {
            content: ContentStore::new(Arc::clone(&storage)),
            cache: AnalysisCache::new(Arc::clone(&storage), config.upsert_retry_attempts),
            gate: AccessGate::new(ledger.clone()),
            registry: TaskRegistry::new(Arc::clone(&storage)),
            checkpoints: CheckpointLog::new(storage, config.checkpoint_retention as usize),
            ledger,
            config,
        })
    }

    pub fn config(&self) -> &VellumConfig {
        &self.config
    }

    pub fn content(&self) -> &ContentStore<S> {
        &self.content
    }

    pub fn cache(&self) -> &AnalysisCache<S> {
        &self.cache
    }

    pub fn ledger(&self) -> &PossessionLedger<S> {
        &self.ledger
    }

    pub fn gate(&self) -> &AccessGate<S> {
        &self.gate
    }

    pub fn registry(&self) -> &TaskRegistry<S> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &CheckpointLog<S> {
        &self.checkpoints
    }

    /// Subscribe a progress observer (UI polling, websocket fan-out).
    pub fn add_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        self.registry.add_progress_sink(sink);
    }

    // ========================================================================
    // INBOUND: USER-FACING OPERATIONS
    // ========================================================================

    /// Record that a user uploaded content, minting the origin possession.
    /// Hashing/normalization happened upstream; only the hash arrives here.
    pub fn register_upload(
        &self,
        user_id: UserId,
        content_hash: ContentHash,
        now: Timestamp,
    ) -> VellumResult<PossessionRecord> {
        self.ledger
            .grant(user_id, content_hash, PossessionSource::OriginUpload, now)
    }

    /// The primary entry point: gate check, cache lookup, task scheduling
    /// on miss, possession mint on hit.
    pub fn request_analysis(
        &self,
        user_id: UserId,
        content_hash: ContentHash,
        agent_version: &str,
        now: Timestamp,
    ) -> VellumResult<AnalysisRequestOutcome> {
        self.gate
            .require_read(Principal::User(user_id), &content_hash)?;

        let key = AnalysisKey::new(content_hash, agent_version);

        // The user's own tracking record; a re-request after cancellation
        // reactivates their view.
        let request = self.cache.track_request(user_id, &key, now)?;
        if request.is_cancelled() {
            self.cache
                .user_request_reactivate(user_id, &content_hash, now)?;
        }

        let outcome = self.cache.upsert_pending(&key, now)?;
        let record = outcome.record().clone();

        if outcome.is_cache_hit() {
            // Two strangers with byte-identical content share the one
            // result; the requester becomes a co-possessor.
            self.ledger
                .grant(user_id, content_hash, PossessionSource::CacheHit, now)?;
            tracing::info!(
                analysis_id = %record.analysis_id,
                "Analysis cache hit"
            );
            return Ok(AnalysisRequestOutcome {
                cache_hit: true,
                analysis_id: record.analysis_id,
                task_id: record.task_id,
            });
        }

        if !outcome.needs_task() {
            // Someone else's computation is in flight; adopt it.
            return Ok(AnalysisRequestOutcome {
                cache_hit: false,
                analysis_id: record.analysis_id,
                task_id: record.task_id,
            });
        }

        // Unique per attempt: a retry of the same analysis gets a new task.
        let task_id = format!("task-{}", vellum_core::new_entity_id());
        self.registry.register(
            NewTask::queued(task_id.clone(), "document_analysis")
                .with_analysis(key.clone())
                .with_max_retries(self.config.default_max_retries),
            now,
        )?;
        self.cache.assign_task(&key, task_id.clone(), now)?;
        tracing::info!(
            analysis_id = %record.analysis_id,
            task_id = %task_id,
            "Analysis cache miss, task scheduled"
        );

        Ok(AnalysisRequestOutcome {
            cache_hit: false,
            analysis_id: record.analysis_id,
            task_id: Some(task_id),
        })
    }

    /// Read the result. `AccessDenied` is identical whether the record is
    /// missing or merely not the caller's; absence behind the gate is a
    /// `NotReady`, not an error.
    pub fn get_result(
        &self,
        user_id: UserId,
        content_hash: ContentHash,
        agent_version: &str,
        now: Timestamp,
    ) -> VellumResult<AnalysisOutcome> {
        self.gate
            .require_read(Principal::User(user_id), &content_hash)?;

        // The caller's own cancellation suppresses their view even though
        // the shared computation may be running to completion.
        if let Some(request) = self.cache.user_request(user_id, &content_hash)? {
            if request.is_cancelled() {
                return Ok(AnalysisOutcome::NotReady {
                    status: AnalysisStatus::Cancelled,
                    progress_percent: 0.0,
                    error: None,
                });
            }
        }

        let key = AnalysisKey::new(content_hash, agent_version);
        let Some(record) = self.cache.get(&key)? else {
            return Ok(AnalysisOutcome::NotReady {
                status: AnalysisStatus::Pending,
                progress_percent: 0.0,
                error: None,
            });
        };

        match record.status {
            AnalysisStatus::Completed => {
                self.ledger.touch_viewed(user_id, &content_hash, now)?;
                let result = record.result.ok_or_else(|| {
                    VellumError::Storage(StorageError::NotFound {
                        kind: vellum_core::EntityKind::Analysis,
                        key: key.display_key(),
                    })
                })?;
                Ok(AnalysisOutcome::Ready {
                    analysis_id: record.analysis_id,
                    result,
                })
            }
            status => {
                let progress = match record.task_id.as_deref() {
                    Some(task_id) => self
                        .registry
                        .get(task_id)?
                        .map(|t| t.progress_percent)
                        .unwrap_or(0.0),
                    None => 0.0,
                };
                Ok(AnalysisOutcome::NotReady {
                    status,
                    progress_percent: progress,
                    error: record.error,
                })
            }
        }
    }

    /// Cancel this user's view of an analysis. The shared record and the
    /// underlying worker are deliberately untouched; cancellation is
    /// per-user visibility suppression, not work termination.
    pub fn cancel_for_user(
        &self,
        user_id: UserId,
        content_hash: ContentHash,
        now: Timestamp,
    ) -> VellumResult<()> {
        self.gate
            .require_read(Principal::User(user_id), &content_hash)?;
        self.cache.cancel_for_user(user_id, &content_hash, now)?;
        Ok(())
    }

    // ========================================================================
    // OUTBOUND: WORKER-FACING OPERATIONS
    // ========================================================================

    /// Worker picked the task up: queued -> started -> processing, and the
    /// linked analysis moves to processing with it.
    pub fn begin_task(&self, task_id: &str, now: Timestamp) -> VellumResult<()> {
        let entry = self.require_task(task_id)?;
        if entry.current_state == TaskState::Queued {
            self.registry
                .transition(task_id, TaskState::Started, TransitionOptions::default(), now)?;
        }
        self.registry.transition(
            task_id,
            TaskState::Processing,
            TransitionOptions::default().with_step("worker started"),
            now,
        )?;

        if let Some(key) = &entry.analysis_key {
            match self.cache.mark_processing(key, now) {
                Ok(_) => {}
                // A recovered task re-enters processing with the analysis
                // already there; that is not a contract violation.
                Err(VellumError::Transition(TransitionError::InvalidAnalysis {
                    from: AnalysisStatus::Processing,
                    ..
                })) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Heartbeat passthrough for processing workers.
    pub fn heartbeat(&self, task_id: &str, now: Timestamp) -> VellumResult<()> {
        self.registry.heartbeat(task_id, now)
    }

    /// Worker reached a well-defined resumption point: write the durable
    /// checkpoint and record the stable checkpoint sub-state.
    ///
    /// Cancellation is cooperative: if an operator cancelled the task, the
    /// state transition here fails with `InvalidTransition`, which is the
    /// worker's signal to stop. There is no mid-step preemption.
    pub fn checkpoint_task(
        &self,
        task_id: &str,
        name: &str,
        progress_percent: f32,
        recoverable_data: serde_json::Value,
        now: Timestamp,
    ) -> VellumResult<Checkpoint> {
        let checkpoint = self.checkpoints.write(
            task_id,
            name,
            progress_percent,
            recoverable_data.clone(),
            vec![],
            now,
        )?;
        self.registry.transition(
            task_id,
            TaskState::Checkpoint,
            TransitionOptions::progress(progress_percent)
                .with_checkpoint_data(recoverable_data)
                .with_step(name),
            now,
        )?;
        Ok(checkpoint)
    }

    /// Worker finished: the shared result lands first (the authoritative
    /// record), then the task closes. A crash in between leaves a stale
    /// task whose recovery validation finds the completed analysis and
    /// resolves without redoing work.
    pub fn complete_task(
        &self,
        task_id: &str,
        result: serde_json::Value,
        now: Timestamp,
    ) -> VellumResult<()> {
        let entry = self.require_task(task_id)?;
        if let Some(key) = &entry.analysis_key {
            self.cache.complete(key, result.clone(), now)?;
        }
        self.registry.transition(
            task_id,
            TaskState::Completed,
            TransitionOptions::progress(100.0)
                .with_result(result)
                .with_step("analysis complete"),
            now,
        )?;
        Ok(())
    }

    /// Worker failed: record the error on both the shared record and the
    /// task. The registry never swallows a failure - the entry ends
    /// terminal or stays discoverably stale for the recovery sweep.
    pub fn fail_task(
        &self,
        task_id: &str,
        error: impl Into<String>,
        now: Timestamp,
    ) -> VellumResult<()> {
        let entry = self.require_task(task_id)?;
        let error = error.into();
        if let Some(key) = &entry.analysis_key {
            self.cache.fail(key, error.clone(), now)?;
        }
        self.registry.transition(
            task_id,
            TaskState::Failed,
            TransitionOptions::default()
                .with_error(error)
                .with_step("analysis failed"),
            now,
        )?;
        Ok(())
    }

    fn require_task(&self, task_id: &str) -> VellumResult<vellum_core::TaskRegistryEntry> {
        self.registry.get(task_id)?.ok_or_else(|| {
            VellumError::Storage(StorageError::UnknownTask {
                task_id: task_id.to_string(),
            })
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
