//! VELLUM Storage - Storage Trait and In-Memory Implementation
//!
//! Defines the storage abstraction layer for VELLUM entities. Workers on
//! different machines coordinate exclusively through this layer, so every
//! mutating method is a single atomic operation: a conditional update keyed
//! by the caller's expected current state. Two workers racing on the same
//! task or content hash cannot both win a transition.
//!
//! `MemoryStorage` realizes atomicity with one write-lock scope per
//! operation. A database-backed implementation would use conditional
//! UPDATE ... WHERE statements with the same contracts.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use vellum_core::{
    AnalysisKey, AnalysisRecord, AnalysisStatus, ArtifactKey, Checkpoint, ContentArtifact,
    ContentHash, EntityId, EntityKind, PossessionRecord, RecoveryQueueEntry, RecoveryStatus,
    StateTransition, StorageError, TaskId, TaskRegistryEntry, TaskState, Timestamp,
    TransitionError, UserId, UserRequest, VellumError, VellumResult,
};

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Forward transition payload for the shared analysis record.
#[derive(Debug, Clone)]
pub struct AnalysisUpdate {
    /// New status.
    pub status: AnalysisStatus,
    /// Result payload, stored on completion.
    pub result: Option<serde_json::Value>,
    /// Error detail, stored on failure. Partial results are kept.
    pub error: Option<String>,
    /// Producing task, recorded when one is scheduled.
    pub task_id: Option<TaskId>,
}

impl AnalysisUpdate {
    pub fn status(status: AnalysisStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            task_id: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Transition payload for a task registry entry.
///
/// Applied only when the entry's current state equals the expected state the
/// caller read, which is what makes the transition race-safe.
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub to: TaskState,
    pub at: Timestamp,
    pub progress: Option<f32>,
    pub checkpoint_data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Set by recovery attempts so bounded retry is visible on the entry.
    pub bump_retry: bool,
}

impl TaskTransition {
    pub fn to(state: TaskState, at: Timestamp) -> Self {
        Self {
            to: state,
            at,
            progress: None,
            checkpoint_data: None,
            error: None,
            result: None,
            bump_retry: false,
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_checkpoint_data(mut self, data: serde_json::Value) -> Self {
        self.checkpoint_data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_retry_bump(mut self) -> Self {
        self.bump_retry = true;
        self
    }
}

/// Update payload for a recovery queue entry.
#[derive(Debug, Clone, Default)]
pub struct RecoveryUpdate {
    pub status: Option<RecoveryStatus>,
    pub bump_attempt: bool,
    pub last_error: Option<String>,
    pub reschedule_for: Option<Timestamp>,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Storage trait for VELLUM entities.
///
/// Implementations must make every method atomic with respect to concurrent
/// calls on the same key. Reads return `Option` for absence; `NotFound`
/// errors are reserved for operations that require an existing row.
pub trait StorageTrait: Send + Sync {
    // === Content Artifacts ===

    /// Insert a new artifact. Fails with `DuplicateKey` if the key exists.
    fn artifact_insert(&self, artifact: &ContentArtifact) -> VellumResult<()>;

    /// Get an artifact by key. Absence is a valid outcome.
    fn artifact_get(&self, key: &ArtifactKey) -> VellumResult<Option<ContentArtifact>>;

    /// List all artifacts derived from one content address.
    fn artifact_list_by_content(&self, content_hmac: &ContentHash)
        -> VellumResult<Vec<ContentArtifact>>;

    /// Delete artifacts produced by algorithm versions older than the given
    /// version. Returns the number removed. The only delete path.
    fn artifact_prune_versions_before(&self, min_algorithm_version: i32) -> VellumResult<usize>;

    // === Analysis Records ===

    /// Insert a new analysis record. Fails with `DuplicateKey` if a record
    /// already exists for the key - the uniqueness constraint behind
    /// at-most-one-in-flight.
    fn analysis_insert(&self, record: &AnalysisRecord) -> VellumResult<()>;

    /// Get the analysis record for a key.
    fn analysis_get(&self, key: &AnalysisKey) -> VellumResult<Option<AnalysisRecord>>;

    /// Get an analysis record by its id.
    fn analysis_get_by_id(&self, analysis_id: EntityId) -> VellumResult<Option<AnalysisRecord>>;

    /// Conditionally transition an analysis record. The update applies only
    /// if the current status is in `expected`; otherwise the call fails with
    /// `InvalidAnalysis` carrying the actual current status.
    fn analysis_compare_and_set(
        &self,
        key: &AnalysisKey,
        expected: &[AnalysisStatus],
        update: AnalysisUpdate,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord>;

    /// Reset a failed or cancelled record to pending for a retry, clearing
    /// result, error, completion timestamp, and producing task. Conditional:
    /// fails with `InvalidAnalysis` from any other status.
    fn analysis_reset_for_retry(
        &self,
        key: &AnalysisKey,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord>;

    // === Possession Records ===

    /// Insert a possession record. Fails with `DuplicateKey` if the user
    /// already possesses the hash.
    fn possession_insert(&self, record: &PossessionRecord) -> VellumResult<()>;

    /// Get a user's possession of a content hash.
    fn possession_get(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<Option<PossessionRecord>>;

    /// Refresh `viewed_at`. The only mutation possession records admit.
    fn possession_touch_viewed(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        now: Timestamp,
    ) -> VellumResult<()>;

    /// List one user's possessions. Never crosses users.
    fn possession_list_for_user(&self, user_id: UserId) -> VellumResult<Vec<PossessionRecord>>;

    // === User Requests ===

    /// Insert a user's request-tracking record. Fails with `DuplicateKey`
    /// if the user already has one for the hash.
    fn user_request_insert(&self, request: &UserRequest) -> VellumResult<()>;

    /// Get a user's request record for a hash.
    fn user_request_get(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<Option<UserRequest>>;

    /// Set the status on a user's request record. Stamps `cancelled_at`
    /// when the new status is `Cancelled`.
    fn user_request_set_status(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        status: AnalysisStatus,
        now: Timestamp,
    ) -> VellumResult<UserRequest>;

    // === Task Registry ===

    /// Insert a new registry entry. Fails with `DuplicateKey` on reuse of a
    /// task id.
    fn task_insert(&self, entry: &TaskRegistryEntry) -> VellumResult<()>;

    /// Get a registry entry.
    fn task_get(&self, task_id: &str) -> VellumResult<Option<TaskRegistryEntry>>;

    /// Atomically apply a transition: the update lands only if the entry's
    /// current state still equals `expected_from`. Appends to the state
    /// history, refreshes the heartbeat, and stamps `started_at` /
    /// `completed_at` on the relevant edges. Fails with `UnknownTask` for
    /// unregistered ids and `InvalidTask` when the entry moved under the
    /// caller.
    fn task_apply_transition(
        &self,
        task_id: &str,
        expected_from: TaskState,
        transition: &TaskTransition,
    ) -> VellumResult<TaskRegistryEntry>;

    /// Refresh `last_heartbeat` without touching state.
    fn task_heartbeat(&self, task_id: &str, now: Timestamp) -> VellumResult<()>;

    /// Discovery query for the recovery sweep: entries with auto-recovery
    /// enabled that are either live with a heartbeat older than
    /// `stale_before`, or already in a stranded diagnostic state. Ordered
    /// by recovery priority descending, then oldest-updated first.
    fn task_list_recoverable(
        &self,
        stale_before: Timestamp,
    ) -> VellumResult<Vec<TaskRegistryEntry>>;

    /// List entries in a given state.
    fn task_list_by_state(&self, state: TaskState) -> VellumResult<Vec<TaskRegistryEntry>>;

    /// Remove terminal entries whose completion is older than `cutoff`.
    /// Returns the number removed.
    fn task_prune_terminal_before(&self, cutoff: Timestamp) -> VellumResult<usize>;

    // === Checkpoints ===

    /// Append a checkpoint. Checkpoints are never updated in place.
    fn checkpoint_insert(&self, checkpoint: &Checkpoint) -> VellumResult<()>;

    /// List a task's checkpoints, newest first.
    fn checkpoint_list_for_task(&self, task_id: &str) -> VellumResult<Vec<Checkpoint>>;

    /// Discard all checkpoints for a task (restart-clean). Returns the
    /// number removed.
    fn checkpoint_delete_for_task(&self, task_id: &str) -> VellumResult<usize>;

    /// Drop the oldest checkpoints beyond `keep`. Returns the number removed.
    fn checkpoint_enforce_retention(&self, task_id: &str, keep: usize) -> VellumResult<usize>;

    // === Recovery Queue ===

    /// Insert a recovery queue entry.
    fn recovery_insert(&self, entry: &RecoveryQueueEntry) -> VellumResult<()>;

    /// Get a recovery queue entry by id.
    fn recovery_get(&self, entry_id: EntityId) -> VellumResult<Option<RecoveryQueueEntry>>;

    /// Find an open (scheduled or in-progress) entry for a task, if any.
    /// Used to avoid scheduling duplicate recoveries.
    fn recovery_find_open_for_task(
        &self,
        task_id: &str,
    ) -> VellumResult<Option<RecoveryQueueEntry>>;

    /// List scheduled entries due at or before `now`.
    fn recovery_list_due(&self, now: Timestamp) -> VellumResult<Vec<RecoveryQueueEntry>>;

    /// List open manual-intervention entries for the operator queue.
    fn recovery_list_manual(&self) -> VellumResult<Vec<RecoveryQueueEntry>>;

    /// Apply an update to a recovery queue entry.
    fn recovery_update(
        &self,
        entry_id: EntityId,
        update: RecoveryUpdate,
        now: Timestamp,
    ) -> VellumResult<RecoveryQueueEntry>;
}

// ============================================================================
// IN-MEMORY STORAGE
// ============================================================================

/// In-memory storage. One write-lock scope per operation makes each
/// operation atomic; used directly in tests and as the reference semantics
/// for database-backed implementations.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    artifacts: RwLock<HashMap<ArtifactKey, ContentArtifact>>,
    analyses: RwLock<AnalysisTable>,
    possessions: RwLock<HashMap<(UserId, ContentHash), PossessionRecord>>,
    user_requests: RwLock<HashMap<(UserId, ContentHash), UserRequest>>,
    tasks: RwLock<HashMap<TaskId, TaskRegistryEntry>>,
    checkpoints: RwLock<HashMap<TaskId, Vec<Checkpoint>>>,
    recovery: RwLock<HashMap<EntityId, RecoveryQueueEntry>>,
}

/// Analysis rows plus the id -> key index for O(1) lookups both ways.
#[derive(Debug, Default)]
struct AnalysisTable {
    by_key: HashMap<AnalysisKey, AnalysisRecord>,
    by_id: HashMap<EntityId, AnalysisKey>,
}

impl MemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of stored analysis records. Test support.
    pub fn analysis_count(&self) -> usize {
        self.analyses.read().map(|t| t.by_key.len()).unwrap_or(0)
    }

    /// Count of stored registry entries. Test support.
    pub fn task_count(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Count of stored artifacts. Test support.
    pub fn artifact_count(&self) -> usize {
        self.artifacts.read().map(|t| t.len()).unwrap_or(0)
    }
}

fn poisoned(_: impl std::fmt::Debug) -> VellumError {
    VellumError::Storage(StorageError::LockPoisoned)
}

impl StorageTrait for MemoryStorage {
    // === Content Artifacts ===

    fn artifact_insert(&self, artifact: &ContentArtifact) -> VellumResult<()> {
        let mut artifacts = self.artifacts.write().map_err(poisoned)?;
        if artifacts.contains_key(&artifact.key) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::Artifact,
                key: artifact.key.display_key(),
            }));
        }
        artifacts.insert(artifact.key.clone(), artifact.clone());
        Ok(())
    }

    fn artifact_get(&self, key: &ArtifactKey) -> VellumResult<Option<ContentArtifact>> {
        let artifacts = self.artifacts.read().map_err(poisoned)?;
        Ok(artifacts.get(key).cloned())
    }

    fn artifact_list_by_content(
        &self,
        content_hmac: &ContentHash,
    ) -> VellumResult<Vec<ContentArtifact>> {
        let artifacts = self.artifacts.read().map_err(poisoned)?;
        Ok(artifacts
            .values()
            .filter(|a| &a.key.content_hmac == content_hmac)
            .cloned()
            .collect())
    }

    fn artifact_prune_versions_before(&self, min_algorithm_version: i32) -> VellumResult<usize> {
        let mut artifacts = self.artifacts.write().map_err(poisoned)?;
        let before = artifacts.len();
        artifacts.retain(|key, _| key.algorithm_version >= min_algorithm_version);
        Ok(before - artifacts.len())
    }

    // === Analysis Records ===

    fn analysis_insert(&self, record: &AnalysisRecord) -> VellumResult<()> {
        let mut analyses = self.analyses.write().map_err(poisoned)?;
        if analyses.by_key.contains_key(&record.key) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::Analysis,
                key: record.key.display_key(),
            }));
        }
        analyses.by_id.insert(record.analysis_id, record.key.clone());
        analyses.by_key.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn analysis_get(&self, key: &AnalysisKey) -> VellumResult<Option<AnalysisRecord>> {
        let analyses = self.analyses.read().map_err(poisoned)?;
        Ok(analyses.by_key.get(key).cloned())
    }

    fn analysis_get_by_id(&self, analysis_id: EntityId) -> VellumResult<Option<AnalysisRecord>> {
        let analyses = self.analyses.read().map_err(poisoned)?;
        Ok(analyses
            .by_id
            .get(&analysis_id)
            .and_then(|key| analyses.by_key.get(key))
            .cloned())
    }

    fn analysis_compare_and_set(
        &self,
        key: &AnalysisKey,
        expected: &[AnalysisStatus],
        update: AnalysisUpdate,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord> {
        let mut analyses = self.analyses.write().map_err(poisoned)?;
        let record = analyses.by_key.get_mut(key).ok_or_else(|| {
            VellumError::Storage(StorageError::NotFound {
                kind: EntityKind::Analysis,
                key: key.display_key(),
            })
        })?;

        if !expected.contains(&record.status) {
            return Err(VellumError::Transition(TransitionError::InvalidAnalysis {
                from: record.status,
                to: update.status,
            }));
        }

        record.status = update.status;
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(error) = update.error {
            record.error = Some(error);
        }
        if let Some(task_id) = update.task_id {
            record.task_id = Some(task_id);
        }
        if update.status == AnalysisStatus::Completed {
            record.completed_at = Some(now);
        }
        record.updated_at = now;

        Ok(record.clone())
    }

    fn analysis_reset_for_retry(
        &self,
        key: &AnalysisKey,
        now: Timestamp,
    ) -> VellumResult<AnalysisRecord> {
        let mut analyses = self.analyses.write().map_err(poisoned)?;
        let record = analyses.by_key.get_mut(key).ok_or_else(|| {
            VellumError::Storage(StorageError::NotFound {
                kind: EntityKind::Analysis,
                key: key.display_key(),
            })
        })?;

        if !matches!(
            record.status,
            AnalysisStatus::Failed | AnalysisStatus::Cancelled
        ) {
            return Err(VellumError::Transition(TransitionError::InvalidAnalysis {
                from: record.status,
                to: AnalysisStatus::Pending,
            }));
        }

        record.status = AnalysisStatus::Pending;
        record.result = None;
        record.error = None;
        record.task_id = None;
        record.completed_at = None;
        record.updated_at = now;

        Ok(record.clone())
    }

    // === Possession Records ===

    fn possession_insert(&self, record: &PossessionRecord) -> VellumResult<()> {
        let mut possessions = self.possessions.write().map_err(poisoned)?;
        let key = (record.user_id, record.content_hash);
        if possessions.contains_key(&key) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::Possession,
                key: format!("{}/{}", record.user_id, hex::encode(record.content_hash)),
            }));
        }
        possessions.insert(key, record.clone());
        Ok(())
    }

    fn possession_get(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<Option<PossessionRecord>> {
        let possessions = self.possessions.read().map_err(poisoned)?;
        Ok(possessions.get(&(user_id, *content_hash)).cloned())
    }

    fn possession_touch_viewed(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        now: Timestamp,
    ) -> VellumResult<()> {
        let mut possessions = self.possessions.write().map_err(poisoned)?;
        let record = possessions
            .get_mut(&(user_id, *content_hash))
            .ok_or_else(|| {
                VellumError::Storage(StorageError::NotFound {
                    kind: EntityKind::Possession,
                    key: format!("{}/{}", user_id, hex::encode(content_hash)),
                })
            })?;
        record.viewed_at = Some(now);
        Ok(())
    }

    fn possession_list_for_user(&self, user_id: UserId) -> VellumResult<Vec<PossessionRecord>> {
        let possessions = self.possessions.read().map_err(poisoned)?;
        Ok(possessions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    // === User Requests ===

    fn user_request_insert(&self, request: &UserRequest) -> VellumResult<()> {
        let mut requests = self.user_requests.write().map_err(poisoned)?;
        let key = (request.user_id, request.content_hash);
        if requests.contains_key(&key) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::UserRequest,
                key: format!("{}/{}", request.user_id, hex::encode(request.content_hash)),
            }));
        }
        requests.insert(key, request.clone());
        Ok(())
    }

    fn user_request_get(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<Option<UserRequest>> {
        let requests = self.user_requests.read().map_err(poisoned)?;
        Ok(requests.get(&(user_id, *content_hash)).cloned())
    }

    fn user_request_set_status(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        status: AnalysisStatus,
        now: Timestamp,
    ) -> VellumResult<UserRequest> {
        let mut requests = self.user_requests.write().map_err(poisoned)?;
        let request = requests.get_mut(&(user_id, *content_hash)).ok_or_else(|| {
            VellumError::Storage(StorageError::NotFound {
                kind: EntityKind::UserRequest,
                key: format!("{}/{}", user_id, hex::encode(content_hash)),
            })
        })?;
        request.status = status;
        if status == AnalysisStatus::Cancelled {
            request.cancelled_at = Some(now);
        } else {
            // Reactivation clears the cancellation stamp.
            request.cancelled_at = None;
        }
        request.updated_at = now;
        Ok(request.clone())
    }

    // === Task Registry ===

    fn task_insert(&self, entry: &TaskRegistryEntry) -> VellumResult<()> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&entry.task_id) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::Task,
                key: entry.task_id.clone(),
            }));
        }
        tasks.insert(entry.task_id.clone(), entry.clone());
        Ok(())
    }

    fn task_get(&self, task_id: &str) -> VellumResult<Option<TaskRegistryEntry>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(task_id).cloned())
    }

    fn task_apply_transition(
        &self,
        task_id: &str,
        expected_from: TaskState,
        transition: &TaskTransition,
    ) -> VellumResult<TaskRegistryEntry> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let entry = tasks.get_mut(task_id).ok_or_else(|| {
            VellumError::Storage(StorageError::UnknownTask {
                task_id: task_id.to_string(),
            })
        })?;

        // The conditional write: a racing worker that moved the entry first
        // wins; this caller observes the actual state and fails.
        if entry.current_state != expected_from {
            return Err(VellumError::Transition(TransitionError::InvalidTask {
                task_id: task_id.to_string(),
                from: entry.current_state,
                to: transition.to,
            }));
        }

        entry.previous_state = Some(entry.current_state);
        entry.current_state = transition.to;
        entry.state_history.push(StateTransition {
            from: Some(expected_from),
            to: transition.to,
            at: transition.at,
            progress: transition.progress,
        });
        if let Some(progress) = transition.progress {
            entry.progress_percent = progress;
        }
        if let Some(data) = &transition.checkpoint_data {
            entry.checkpoint_data = Some(data.clone());
        }
        if let Some(error) = &transition.error {
            entry.error = Some(error.clone());
        }
        if let Some(result) = &transition.result {
            entry.result = Some(result.clone());
        }
        if transition.bump_retry {
            entry.retry_count += 1;
        }
        if entry.started_at.is_none()
            && matches!(transition.to, TaskState::Started | TaskState::Processing)
        {
            entry.started_at = Some(transition.at);
        }
        if transition.to.is_terminal() {
            entry.completed_at = Some(transition.at);
        }
        entry.last_heartbeat = transition.at;
        entry.updated_at = transition.at;

        Ok(entry.clone())
    }

    fn task_heartbeat(&self, task_id: &str, now: Timestamp) -> VellumResult<()> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let entry = tasks.get_mut(task_id).ok_or_else(|| {
            VellumError::Storage(StorageError::UnknownTask {
                task_id: task_id.to_string(),
            })
        })?;
        entry.last_heartbeat = now;
        Ok(())
    }

    fn task_list_recoverable(
        &self,
        stale_before: Timestamp,
    ) -> VellumResult<Vec<TaskRegistryEntry>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut candidates: Vec<TaskRegistryEntry> = tasks
            .values()
            .filter(|t| {
                t.auto_recovery_enabled
                    && ((t.current_state.is_live() && t.last_heartbeat < stale_before)
                        || t.current_state.is_stranded())
            })
            .cloned()
            .collect();
        // Priority first; oldest-updated breaks ties so nothing starves.
        candidates.sort_by(|a, b| {
            b.recovery_priority
                .cmp(&a.recovery_priority)
                .then(a.updated_at.cmp(&b.updated_at))
        });
        Ok(candidates)
    }

    fn task_list_by_state(&self, state: TaskState) -> VellumResult<Vec<TaskRegistryEntry>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks
            .values()
            .filter(|t| t.current_state == state)
            .cloned()
            .collect())
    }

    fn task_prune_terminal_before(&self, cutoff: Timestamp) -> VellumResult<usize> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.current_state.is_terminal()
                && t.completed_at.map(|c| c < cutoff).unwrap_or(false))
        });
        Ok(before - tasks.len())
    }

    // === Checkpoints ===

    fn checkpoint_insert(&self, checkpoint: &Checkpoint) -> VellumResult<()> {
        let mut checkpoints = self.checkpoints.write().map_err(poisoned)?;
        checkpoints
            .entry(checkpoint.task_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn checkpoint_list_for_task(&self, task_id: &str) -> VellumResult<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().map_err(poisoned)?;
        let mut list = checkpoints.get(task_id).cloned().unwrap_or_default();
        // UUIDv7 ids break created_at ties in insertion order.
        list.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        Ok(list)
    }

    fn checkpoint_delete_for_task(&self, task_id: &str) -> VellumResult<usize> {
        let mut checkpoints = self.checkpoints.write().map_err(poisoned)?;
        Ok(checkpoints.remove(task_id).map(|v| v.len()).unwrap_or(0))
    }

    fn checkpoint_enforce_retention(&self, task_id: &str, keep: usize) -> VellumResult<usize> {
        let mut checkpoints = self.checkpoints.write().map_err(poisoned)?;
        let Some(list) = checkpoints.get_mut(task_id) else {
            return Ok(0);
        };
        if list.len() <= keep {
            return Ok(0);
        }
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let excess = list.len() - keep;
        list.drain(0..excess);
        Ok(excess)
    }

    // === Recovery Queue ===

    fn recovery_insert(&self, entry: &RecoveryQueueEntry) -> VellumResult<()> {
        let mut recovery = self.recovery.write().map_err(poisoned)?;
        if recovery.contains_key(&entry.entry_id) {
            return Err(VellumError::Storage(StorageError::DuplicateKey {
                kind: EntityKind::RecoveryEntry,
                key: entry.entry_id.to_string(),
            }));
        }
        recovery.insert(entry.entry_id, entry.clone());
        Ok(())
    }

    fn recovery_get(&self, entry_id: EntityId) -> VellumResult<Option<RecoveryQueueEntry>> {
        let recovery = self.recovery.read().map_err(poisoned)?;
        Ok(recovery.get(&entry_id).cloned())
    }

    fn recovery_find_open_for_task(
        &self,
        task_id: &str,
    ) -> VellumResult<Option<RecoveryQueueEntry>> {
        let recovery = self.recovery.read().map_err(poisoned)?;
        Ok(recovery
            .values()
            .find(|e| e.task_id == task_id && e.status.is_open())
            .cloned())
    }

    fn recovery_list_due(&self, now: Timestamp) -> VellumResult<Vec<RecoveryQueueEntry>> {
        let recovery = self.recovery.read().map_err(poisoned)?;
        let mut due: Vec<RecoveryQueueEntry> = recovery
            .values()
            .filter(|e| e.status == RecoveryStatus::Scheduled && e.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(due)
    }

    fn recovery_list_manual(&self) -> VellumResult<Vec<RecoveryQueueEntry>> {
        let recovery = self.recovery.read().map_err(poisoned)?;
        Ok(recovery
            .values()
            .filter(|e| {
                e.method == vellum_core::RecoveryMethod::ManualIntervention && e.status.is_open()
            })
            .cloned()
            .collect())
    }

    fn recovery_update(
        &self,
        entry_id: EntityId,
        update: RecoveryUpdate,
        now: Timestamp,
    ) -> VellumResult<RecoveryQueueEntry> {
        let mut recovery = self.recovery.write().map_err(poisoned)?;
        let entry = recovery.get_mut(&entry_id).ok_or_else(|| {
            VellumError::Storage(StorageError::NotFound {
                kind: EntityKind::RecoveryEntry,
                key: entry_id.to_string(),
            })
        })?;
        if let Some(status) = update.status {
            entry.status = status;
        }
        if update.bump_attempt {
            entry.attempts += 1;
        }
        if let Some(error) = update.last_error {
            entry.last_error = Some(error);
        }
        if let Some(when) = update.reschedule_for {
            entry.scheduled_for = when;
        }
        entry.updated_at = now;
        Ok(entry.clone())
    }
}

/// Timestamp helper for tests and callers that need "now".
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vellum_core::{compute_content_hmac, ArtifactKind, PossessionSource, RecoveryMethod};

    fn hash(label: &str) -> ContentHash {
        compute_content_hmac(b"test-key", label.as_bytes())
    }

    fn make_task(task_id: &str, state: TaskState, now: Timestamp) -> TaskRegistryEntry {
        TaskRegistryEntry {
            task_id: task_id.to_string(),
            task_name: "document_analysis".to_string(),
            current_state: state,
            previous_state: None,
            state_history: vec![StateTransition {
                from: None,
                to: state,
                at: now,
                progress: None,
            }],
            progress_percent: 0.0,
            checkpoint_data: None,
            last_heartbeat: now,
            retry_count: 0,
            max_retries: 3,
            recovery_priority: 0,
            auto_recovery_enabled: true,
            analysis_key: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_artifact_insert_and_get() {
        let storage = MemoryStorage::new();
        let key = ArtifactKey::document(hash("doc"), 1, "fp", ArtifactKind::FullText);
        let artifact = ContentArtifact::from_payload(key.clone(), b"text".to_vec(), now());
        storage.artifact_insert(&artifact).unwrap();

        let fetched = storage.artifact_get(&key).unwrap().unwrap();
        assert_eq!(fetched.artifact_id, artifact.artifact_id);

        let missing = ArtifactKey::document(hash("doc"), 2, "fp", ArtifactKind::FullText);
        assert!(storage.artifact_get(&missing).unwrap().is_none());
    }

    #[test]
    fn test_artifact_duplicate_key_rejected() {
        let storage = MemoryStorage::new();
        let key = ArtifactKey::document(hash("doc"), 1, "fp", ArtifactKind::FullText);
        let artifact = ContentArtifact::from_payload(key.clone(), b"text".to_vec(), now());
        storage.artifact_insert(&artifact).unwrap();

        let again = ContentArtifact::from_payload(key, b"other".to_vec(), now());
        assert!(matches!(
            storage.artifact_insert(&again),
            Err(VellumError::Storage(StorageError::DuplicateKey { .. }))
        ));
    }

    #[test]
    fn test_artifact_prune_versions() {
        let storage = MemoryStorage::new();
        for version in [1, 2, 3] {
            let key = ArtifactKey::document(hash("doc"), version, "fp", ArtifactKind::FullText);
            let artifact = ContentArtifact::from_payload(key, b"text".to_vec(), now());
            storage.artifact_insert(&artifact).unwrap();
        }
        let removed = storage.artifact_prune_versions_before(3).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.artifact_count(), 1);
    }

    #[test]
    fn test_analysis_unique_per_key() {
        let storage = MemoryStorage::new();
        let key = AnalysisKey::new(hash("c1"), "v1");
        let record = AnalysisRecord::new_pending(key.clone(), now());
        storage.analysis_insert(&record).unwrap();

        let rival = AnalysisRecord::new_pending(key.clone(), now());
        assert!(matches!(
            storage.analysis_insert(&rival),
            Err(VellumError::Storage(StorageError::DuplicateKey { .. }))
        ));
        assert_eq!(storage.analysis_count(), 1);
    }

    #[test]
    fn test_analysis_get_by_id() {
        let storage = MemoryStorage::new();
        let key = AnalysisKey::new(hash("c1"), "v1");
        let record = AnalysisRecord::new_pending(key, now());
        storage.analysis_insert(&record).unwrap();

        let fetched = storage.analysis_get_by_id(record.analysis_id).unwrap().unwrap();
        assert_eq!(fetched.analysis_id, record.analysis_id);
    }

    #[test]
    fn test_analysis_compare_and_set_guards_status() {
        let storage = MemoryStorage::new();
        let key = AnalysisKey::new(hash("c1"), "v1");
        storage
            .analysis_insert(&AnalysisRecord::new_pending(key.clone(), now()))
            .unwrap();

        // Pending -> Processing allowed.
        let updated = storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Pending],
                AnalysisUpdate::status(AnalysisStatus::Processing),
                now(),
            )
            .unwrap();
        assert_eq!(updated.status, AnalysisStatus::Processing);

        // A second caller expecting Pending loses the race.
        let err = storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Pending],
                AnalysisUpdate::status(AnalysisStatus::Processing),
                now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Transition(TransitionError::InvalidAnalysis {
                from: AnalysisStatus::Processing,
                ..
            })
        ));
    }

    #[test]
    fn test_analysis_completion_stamps_timestamp() {
        let storage = MemoryStorage::new();
        let key = AnalysisKey::new(hash("c1"), "v1");
        storage
            .analysis_insert(&AnalysisRecord::new_pending(key.clone(), now()))
            .unwrap();
        storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Pending],
                AnalysisUpdate::status(AnalysisStatus::Processing),
                now(),
            )
            .unwrap();
        let completed = storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Processing],
                AnalysisUpdate::status(AnalysisStatus::Completed)
                    .with_result(serde_json::json!({"score": 7.2})),
                now(),
            )
            .unwrap();
        assert!(completed.completed_at.is_some());
        assert_eq!(completed.result.unwrap()["score"], 7.2);
    }

    #[test]
    fn test_analysis_reset_only_from_terminal_failures() {
        let storage = MemoryStorage::new();
        let key = AnalysisKey::new(hash("c1"), "v1");
        storage
            .analysis_insert(&AnalysisRecord::new_pending(key.clone(), now()))
            .unwrap();

        // Pending is not resettable.
        assert!(storage.analysis_reset_for_retry(&key, now()).is_err());

        storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Pending],
                AnalysisUpdate::status(AnalysisStatus::Processing),
                now(),
            )
            .unwrap();
        storage
            .analysis_compare_and_set(
                &key,
                &[AnalysisStatus::Processing],
                AnalysisUpdate::status(AnalysisStatus::Failed).with_error("model timeout"),
                now(),
            )
            .unwrap();

        let reset = storage.analysis_reset_for_retry(&key, now()).unwrap();
        assert_eq!(reset.status, AnalysisStatus::Pending);
        assert!(reset.error.is_none());
        assert!(reset.task_id.is_none());
    }

    #[test]
    fn test_possession_duplicate_and_touch() {
        let storage = MemoryStorage::new();
        let user = vellum_core::new_entity_id();
        let content = hash("c1");
        let record =
            PossessionRecord::new(user, content, PossessionSource::OriginUpload, now());
        storage.possession_insert(&record).unwrap();

        let again = PossessionRecord::new(user, content, PossessionSource::CacheHit, now());
        assert!(storage.possession_insert(&again).is_err());

        storage.possession_touch_viewed(user, &content, now()).unwrap();
        let fetched = storage.possession_get(user, &content).unwrap().unwrap();
        assert!(fetched.viewed_at.is_some());
        // Source is unchanged: the original grant survives.
        assert_eq!(fetched.source, PossessionSource::OriginUpload);
    }

    #[test]
    fn test_possession_list_never_crosses_users() {
        let storage = MemoryStorage::new();
        let alice = vellum_core::new_entity_id();
        let bob = vellum_core::new_entity_id();
        let content = hash("shared");
        storage
            .possession_insert(&PossessionRecord::new(
                alice,
                content,
                PossessionSource::OriginUpload,
                now(),
            ))
            .unwrap();
        storage
            .possession_insert(&PossessionRecord::new(
                bob,
                content,
                PossessionSource::CacheHit,
                now(),
            ))
            .unwrap();

        let alice_rows = storage.possession_list_for_user(alice).unwrap();
        assert_eq!(alice_rows.len(), 1);
        assert_eq!(alice_rows[0].user_id, alice);
    }

    #[test]
    fn test_user_request_cancel_stamps_timestamp() {
        let storage = MemoryStorage::new();
        let user = vellum_core::new_entity_id();
        let content = hash("c1");
        storage
            .user_request_insert(&UserRequest::new(user, content, "v1", now()))
            .unwrap();
        let cancelled = storage
            .user_request_set_status(user, &content, AnalysisStatus::Cancelled, now())
            .unwrap();
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_task_transition_appends_history_and_stamps() {
        let storage = MemoryStorage::new();
        let t0 = now();
        storage.task_insert(&make_task("t-1", TaskState::Queued, t0)).unwrap();

        let entry = storage
            .task_apply_transition(
                "t-1",
                TaskState::Queued,
                &TaskTransition::to(TaskState::Started, t0),
            )
            .unwrap();
        assert_eq!(entry.current_state, TaskState::Started);
        assert_eq!(entry.previous_state, Some(TaskState::Queued));
        assert!(entry.started_at.is_some());
        assert_eq!(entry.state_history.len(), 2);

        let entry = storage
            .task_apply_transition(
                "t-1",
                TaskState::Started,
                &TaskTransition::to(TaskState::Processing, t0).with_progress(10.0),
            )
            .unwrap();
        assert_eq!(entry.progress_percent, 10.0);

        let entry = storage
            .task_apply_transition(
                "t-1",
                TaskState::Processing,
                &TaskTransition::to(TaskState::Completed, t0)
                    .with_result(serde_json::json!({"score": 7.2})),
            )
            .unwrap();
        assert!(entry.completed_at.is_some());
        assert_eq!(entry.state_history.len(), 4);
    }

    #[test]
    fn test_task_transition_race_loser_fails() {
        let storage = MemoryStorage::new();
        let t0 = now();
        storage.task_insert(&make_task("t-1", TaskState::Processing, t0)).unwrap();

        storage
            .task_apply_transition(
                "t-1",
                TaskState::Processing,
                &TaskTransition::to(TaskState::Completed, t0),
            )
            .unwrap();

        // Second worker raced on the same expected state and loses.
        let err = storage
            .task_apply_transition(
                "t-1",
                TaskState::Processing,
                &TaskTransition::to(TaskState::Failed, t0),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Transition(TransitionError::InvalidTask {
                from: TaskState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_task_unknown_id() {
        let storage = MemoryStorage::new();
        let err = storage
            .task_apply_transition(
                "ghost",
                TaskState::Queued,
                &TaskTransition::to(TaskState::Started, now()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Storage(StorageError::UnknownTask { .. })
        ));
        assert!(storage.task_heartbeat("ghost", now()).is_err());
    }

    #[test]
    fn test_task_list_recoverable_ordering() {
        let storage = MemoryStorage::new();
        let t0 = now();
        let stale = t0 - ChronoDuration::minutes(30);

        let mut low = make_task("t-low", TaskState::Processing, t0);
        low.last_heartbeat = stale;
        low.recovery_priority = 1;
        low.updated_at = t0 - ChronoDuration::minutes(5);
        storage.task_insert(&low).unwrap();

        let mut high = make_task("t-high", TaskState::Processing, t0);
        high.last_heartbeat = stale;
        high.recovery_priority = 10;
        high.updated_at = t0;
        storage.task_insert(&high).unwrap();

        let mut fresh = make_task("t-fresh", TaskState::Processing, t0);
        fresh.last_heartbeat = t0;
        storage.task_insert(&fresh).unwrap();

        let mut disabled = make_task("t-disabled", TaskState::Processing, t0);
        disabled.last_heartbeat = stale;
        disabled.auto_recovery_enabled = false;
        storage.task_insert(&disabled).unwrap();

        let recoverable = storage
            .task_list_recoverable(t0 - ChronoDuration::minutes(10))
            .unwrap();
        let ids: Vec<&str> = recoverable.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t-high", "t-low"]);
    }

    #[test]
    fn test_task_list_recoverable_includes_stranded() {
        let storage = MemoryStorage::new();
        let t0 = now();
        // Fresh heartbeat but already marked orphaned by a previous sweep.
        let mut orphaned = make_task("t-orphan", TaskState::Orphaned, t0);
        orphaned.last_heartbeat = t0;
        storage.task_insert(&orphaned).unwrap();

        let recoverable = storage.task_list_recoverable(t0).unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].task_id, "t-orphan");
    }

    #[test]
    fn test_task_list_by_state() {
        let storage = MemoryStorage::new();
        let t0 = now();
        storage.task_insert(&make_task("t-1", TaskState::Queued, t0)).unwrap();
        storage.task_insert(&make_task("t-2", TaskState::Processing, t0)).unwrap();
        storage.task_insert(&make_task("t-3", TaskState::Processing, t0)).unwrap();

        assert_eq!(storage.task_list_by_state(TaskState::Processing).unwrap().len(), 2);
        assert_eq!(storage.task_list_by_state(TaskState::Queued).unwrap().len(), 1);
        assert!(storage.task_list_by_state(TaskState::Failed).unwrap().is_empty());
    }

    #[test]
    fn test_task_prune_terminal_keeps_recent_and_live() {
        let storage = MemoryStorage::new();
        let t0 = now();

        storage
            .task_insert(&make_task("t-old", TaskState::Queued, t0))
            .unwrap();
        storage
            .task_apply_transition(
                "t-old",
                TaskState::Queued,
                &TaskTransition::to(TaskState::Cancelled, t0 - ChronoDuration::days(60)),
            )
            .unwrap();

        storage.task_insert(&make_task("t-live", TaskState::Processing, t0)).unwrap();

        let pruned = storage
            .task_prune_terminal_before(t0 - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(storage.task_get("t-old").unwrap().is_none());
        assert!(storage.task_get("t-live").unwrap().is_some());
    }

    #[test]
    fn test_checkpoint_list_newest_first_and_retention() {
        let storage = MemoryStorage::new();
        let t0 = now();
        for (idx, name) in ["step1", "step2", "step3"].iter().enumerate() {
            let data = serde_json::json!({"step": name});
            let checkpoint = Checkpoint {
                checkpoint_id: vellum_core::new_entity_id(),
                task_id: "t-1".to_string(),
                name: name.to_string(),
                progress_percent: idx as f32 * 25.0,
                recoverable_data: data.clone(),
                external_refs: vec![],
                integrity_hash: Checkpoint::compute_integrity(
                    "t-1",
                    name,
                    idx as f32 * 25.0,
                    &data,
                ),
                created_at: t0 + ChronoDuration::seconds(idx as i64),
            };
            storage.checkpoint_insert(&checkpoint).unwrap();
        }

        let list = storage.checkpoint_list_for_task("t-1").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].name, "step3");

        let removed = storage.checkpoint_enforce_retention("t-1", 2).unwrap();
        assert_eq!(removed, 1);
        let list = storage.checkpoint_list_for_task("t-1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "step2");

        let dropped = storage.checkpoint_delete_for_task("t-1").unwrap();
        assert_eq!(dropped, 2);
        assert!(storage.checkpoint_list_for_task("t-1").unwrap().is_empty());
    }

    #[test]
    fn test_recovery_queue_lifecycle() {
        let storage = MemoryStorage::new();
        let t0 = now();
        let entry = RecoveryQueueEntry::new(
            "t-1".to_string(),
            RecoveryMethod::ResumeCheckpoint,
            t0,
            3,
            t0,
        );
        storage.recovery_insert(&entry).unwrap();

        assert!(storage.recovery_find_open_for_task("t-1").unwrap().is_some());
        assert_eq!(storage.recovery_list_due(t0).unwrap().len(), 1);

        let updated = storage
            .recovery_update(
                entry.entry_id,
                RecoveryUpdate {
                    status: Some(RecoveryStatus::Succeeded),
                    bump_attempt: true,
                    ..Default::default()
                },
                t0,
            )
            .unwrap();
        assert_eq!(updated.attempts, 1);
        assert!(storage.recovery_find_open_for_task("t-1").unwrap().is_none());
        assert!(storage.recovery_list_due(t0).unwrap().is_empty());
    }

    #[test]
    fn test_recovery_not_due_until_scheduled_for() {
        let storage = MemoryStorage::new();
        let t0 = now();
        let entry = RecoveryQueueEntry::new(
            "t-1".to_string(),
            RecoveryMethod::RestartClean,
            t0 + ChronoDuration::minutes(5),
            3,
            t0,
        );
        storage.recovery_insert(&entry).unwrap();
        assert!(storage.recovery_list_due(t0).unwrap().is_empty());
        assert_eq!(
            storage
                .recovery_list_due(t0 + ChronoDuration::minutes(6))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_recovery_manual_queue() {
        let storage = MemoryStorage::new();
        let t0 = now();
        storage
            .recovery_insert(&RecoveryQueueEntry::new(
                "t-1".to_string(),
                RecoveryMethod::ManualIntervention,
                t0,
                1,
                t0,
            ))
            .unwrap();
        storage
            .recovery_insert(&RecoveryQueueEntry::new(
                "t-2".to_string(),
                RecoveryMethod::ResumeCheckpoint,
                t0,
                3,
                t0,
            ))
            .unwrap();

        let manual = storage.recovery_list_manual().unwrap();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].task_id, "t-1");
    }
}
