//! Checkpoint log: durable, named, integrity-verified recovery points.

use std::sync::Arc;

use vellum_core::{
    Checkpoint, EntityId, TaskId, Timestamp, VellumResult,
};
use vellum_storage::StorageTrait;

/// Checkpoint store service.
///
/// `(task_id, name)` is not unique: a task may checkpoint the same name
/// again on idempotent re-entry. The latest valid checkpoint is
/// authoritative; rows are superseded, never overwritten.
pub struct CheckpointLog<S: StorageTrait> {
    storage: Arc<S>,
    /// Checkpoints retained per task before the oldest are dropped.
    retention: usize,
}

impl<S: StorageTrait> Clone for CheckpointLog<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            retention: self.retention,
        }
    }
}

impl<S: StorageTrait> CheckpointLog<S> {
    pub fn new(storage: Arc<S>, retention: usize) -> Self {
        Self { storage, retention }
    }

    /// Write a checkpoint at a well-defined resumption point ("text
    /// extracted", "entities extracted"). The integrity hash is computed
    /// over the checkpoint's own payload and verified again on resume.
    pub fn write(
        &self,
        task_id: impl Into<TaskId>,
        name: impl Into<String>,
        progress_percent: f32,
        recoverable_data: serde_json::Value,
        external_refs: Vec<EntityId>,
        now: Timestamp,
    ) -> VellumResult<Checkpoint> {
        let task_id = task_id.into();
        let name = name.into();
        let integrity_hash =
            Checkpoint::compute_integrity(&task_id, &name, progress_percent, &recoverable_data);
        let checkpoint = Checkpoint {
            checkpoint_id: vellum_core::new_entity_id(),
            task_id: task_id.clone(),
            name,
            progress_percent,
            recoverable_data,
            external_refs,
            integrity_hash,
            created_at: now,
        };
        self.storage.checkpoint_insert(&checkpoint)?;
        self.storage
            .checkpoint_enforce_retention(&task_id, self.retention)?;
        Ok(checkpoint)
    }

    /// The most recent checkpoint whose integrity check passes - not
    /// necessarily the most recent row. Corrupt rows are logged and
    /// skipped; recovery falls back to restart-clean when none verify.
    pub fn latest_valid(&self, task_id: &str) -> VellumResult<Option<Checkpoint>> {
        let checkpoints = self.storage.checkpoint_list_for_task(task_id)?;
        for checkpoint in checkpoints {
            if checkpoint.verify_integrity() {
                return Ok(Some(checkpoint));
            }
            tracing::warn!(
                task_id,
                checkpoint_id = %checkpoint.checkpoint_id,
                name = %checkpoint.name,
                "Checkpoint failed integrity verification, skipping"
            );
        }
        Ok(None)
    }

    /// All checkpoints for a task, newest first. Diagnostic use.
    pub fn list(&self, task_id: &str) -> VellumResult<Vec<Checkpoint>> {
        self.storage.checkpoint_list_for_task(task_id)
    }

    /// Discard all checkpoints (restart-clean). Returns the number removed.
    pub fn discard_all(&self, task_id: &str) -> VellumResult<usize> {
        self.storage.checkpoint_delete_for_task(task_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
