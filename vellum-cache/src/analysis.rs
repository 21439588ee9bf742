//! Analysis cache state machine.
//!
//! One authoritative record per `(content_hash, agent_version)`. The
//! uniqueness lives in the storage key, not in locks; racing creators
//! resolve by conflict-upsert with the loser adopting the winner's record.

use std::sync::Arc;

use vellum_core::{
    AnalysisKey, AnalysisRecord, AnalysisStatus, ContentHash, StorageError, TaskId, Timestamp,
    UserId, UserRequest, VellumError, VellumResult,
};
use vellum_storage::{AnalysisUpdate, StorageTrait};

/// Result of `upsert_pending`, distinguishing how the record was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No record existed; a fresh pending one was created.
    Created(AnalysisRecord),
    /// Another caller's non-terminal record was adopted as-is.
    AdoptedInFlight(AnalysisRecord),
    /// A failed/cancelled record was reset to pending for retry.
    ResetForRetry(AnalysisRecord),
    /// The record is completed; it is never reset. Treat as a cache hit.
    AlreadyCompleted(AnalysisRecord),
}

impl UpsertOutcome {
    /// The underlying record, however it was obtained.
    pub fn record(&self) -> &AnalysisRecord {
        match self {
            UpsertOutcome::Created(r)
            | UpsertOutcome::AdoptedInFlight(r)
            | UpsertOutcome::ResetForRetry(r)
            | UpsertOutcome::AlreadyCompleted(r) => r,
        }
    }

    /// Whether a completed result already existed.
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, UpsertOutcome::AlreadyCompleted(_))
    }

    /// Whether this caller should schedule computation.
    pub fn needs_task(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_) | UpsertOutcome::ResetForRetry(_))
    }
}

/// Analysis cache service.
pub struct AnalysisCache<S: StorageTrait> {
    storage: Arc<S>,
    /// Bound for internal retry of transient upsert write conflicts.
    retry_attempts: u32,
}

impl<S: StorageTrait> Clone for AnalysisCache<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            retry_attempts: self.retry_attempts,
        }
    }
}

impl<S: StorageTrait> AnalysisCache<S> {
    pub fn new(storage: Arc<S>, retry_attempts: u32) -> Self {
        Self {
            storage,
            retry_attempts,
        }
    }

    /// Get the record for a key, if any.
    pub fn get(&self, key: &AnalysisKey) -> VellumResult<Option<AnalysisRecord>> {
        self.storage.analysis_get(key)
    }

    /// Ensure a record exists for the key and is in a workable state.
    ///
    /// - absent: create pending
    /// - failed/cancelled: reset to pending for retry
    /// - pending/processing: adopt the in-flight record
    /// - completed: no-op returning the existing record; completed analyses
    ///   are never reset, which protects readers of the shared result and
    ///   prevents duplicate recomputation
    ///
    /// Transient races (another caller inserting, resetting, or completing
    /// between our read and write) are retried internally up to the bound
    /// before surfacing as `ConflictRetryExhausted`.
    pub fn upsert_pending(&self, key: &AnalysisKey, now: Timestamp) -> VellumResult<UpsertOutcome> {
        for _ in 0..self.retry_attempts {
            match self.try_upsert(key, now)? {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }
        Err(VellumError::Storage(StorageError::ConflictRetryExhausted {
            key: key.display_key(),
            attempts: self.retry_attempts,
        }))
    }

    /// One upsert attempt. `Ok(None)` means "lost a race, try again".
    fn try_upsert(&self, key: &AnalysisKey, now: Timestamp) -> VellumResult<Option<UpsertOutcome>> {
        match self.storage.analysis_get(key)? {
            None => {
                let record = AnalysisRecord::new_pending(key.clone(), now);
                match self.storage.analysis_insert(&record) {
                    Ok(()) => Ok(Some(UpsertOutcome::Created(record))),
                    // Lost the creation race; loop around and adopt.
                    Err(VellumError::Storage(StorageError::DuplicateKey { .. })) => Ok(None),
                    Err(other) => Err(other),
                }
            }
            Some(record) => match record.status {
                AnalysisStatus::Completed => Ok(Some(UpsertOutcome::AlreadyCompleted(record))),
                AnalysisStatus::Pending | AnalysisStatus::Processing => {
                    Ok(Some(UpsertOutcome::AdoptedInFlight(record)))
                }
                AnalysisStatus::Failed | AnalysisStatus::Cancelled => {
                    match self.storage.analysis_reset_for_retry(key, now) {
                        Ok(reset) => Ok(Some(UpsertOutcome::ResetForRetry(reset))),
                        // Someone else reset or completed it first.
                        Err(VellumError::Transition(_)) => Ok(None),
                        Err(other) => Err(other),
                    }
                }
            },
        }
    }

    /// Attach the producing task to a pending record.
    pub fn assign_task(
        &self,
        key: &AnalysisKey,
        task_id: TaskId,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord> {
        self.storage.analysis_compare_and_set(
            key,
            &[AnalysisStatus::Pending],
            AnalysisUpdate::status(AnalysisStatus::Pending).with_task(task_id),
            now,
        )
    }

    /// Move a pending record to processing. Requires current state pending.
    pub fn mark_processing(&self, key: &AnalysisKey, now: Timestamp) -> VellumResult<AnalysisRecord> {
        self.storage.analysis_compare_and_set(
            key,
            &[AnalysisStatus::Pending],
            AnalysisUpdate::status(AnalysisStatus::Processing),
            now,
        )
    }

    /// Store the result. Requires current state processing; calling from a
    /// terminal state is an `InvalidTransition` contract violation.
    pub fn complete(
        &self,
        key: &AnalysisKey,
        result: serde_json::Value,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord> {
        self.storage.analysis_compare_and_set(
            key,
            &[AnalysisStatus::Processing],
            AnalysisUpdate::status(AnalysisStatus::Completed).with_result(result),
            now,
        )
    }

    /// Record a failure. Requires a non-terminal state. Partial results are
    /// kept for diagnosis; only the status and error detail change.
    pub fn fail(
        &self,
        key: &AnalysisKey,
        error: impl Into<String>,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord> {
        self.storage.analysis_compare_and_set(
            key,
            &[AnalysisStatus::Pending, AnalysisStatus::Processing],
            AnalysisUpdate::status(AnalysisStatus::Failed).with_error(error),
            now,
        )
    }

    /// Cancel one user's view of an analysis.
    ///
    /// Deliberately does NOT touch the shared AnalysisRecord: other
    /// possessors may be relying on the in-flight computation. Only the
    /// caller's own request-tracking record is marked cancelled.
    pub fn cancel_for_user(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        now: Timestamp,
    ) -> VellumResult<UserRequest> {
        let request = self
            .storage
            .user_request_set_status(user_id, content_hash, AnalysisStatus::Cancelled, now)?;
        tracing::info!(
            user_id = %user_id,
            content = %hex::encode(content_hash),
            "User cancelled their view; shared analysis untouched"
        );
        Ok(request)
    }

    /// Record that a user asked for this analysis. Idempotent per
    /// `(user, content_hash)`; an existing request is returned as-is.
    pub fn track_request(
        &self,
        user_id: UserId,
        key: &AnalysisKey,
        now: Timestamp,
    ) -> VellumResult<UserRequest> {
        if let Some(existing) = self.storage.user_request_get(user_id, &key.content_hash)? {
            return Ok(existing);
        }
        let request = UserRequest::new(
            user_id,
            key.content_hash,
            key.agent_version.clone(),
            now,
        );
        match self.storage.user_request_insert(&request) {
            Ok(()) => Ok(request),
            Err(VellumError::Storage(StorageError::DuplicateKey { .. })) => {
                self.storage
                    .user_request_get(user_id, &key.content_hash)?
                    .ok_or_else(|| {
                        VellumError::Storage(StorageError::NotFound {
                            kind: vellum_core::EntityKind::UserRequest,
                            key: key.display_key(),
                        })
                    })
            }
            Err(other) => Err(other),
        }
    }

    /// Reactivate a cancelled request when the user asks again.
    pub fn user_request_reactivate(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        now: Timestamp,
    ) -> VellumResult<UserRequest> {
        self.storage
            .user_request_set_status(user_id, content_hash, AnalysisStatus::Pending, now)
    }

    /// A user's own request record, if any.
    pub fn user_request(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<Option<UserRequest>> {
        self.storage.user_request_get(user_id, content_hash)
    }
}

// ============================================================================
// TESTS
// ============================================================================
