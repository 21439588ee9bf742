//! Durable entity structs.
//!
//! Every struct here is a persisted record. Nothing in-memory-only may
//! determine correctness after a crash, so these carry all state needed to
//! reconstruct a worker's position from storage alone.

use crate::enums::{
    AnalysisStatus, ArtifactKind, PossessionSource, RecoveryMethod, RecoveryStatus, TaskState,
};
use crate::{
    compute_content_digest, ContentHash, EntityId, RawContent, TaskId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONTENT STORE
// ============================================================================

/// Address of a derived artifact.
///
/// `algorithm_version` and `params_fingerprint` are part of the key so a new
/// extraction algorithm or parameter set never collides with stale artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub content_hmac: ContentHash,
    pub algorithm_version: i32,
    pub params_fingerprint: String,
    pub kind: ArtifactKind,
    pub page_number: Option<i32>,
    pub sub_index: Option<i32>,
}

impl ArtifactKey {
    /// Key for a document-level artifact (no page or sub-index).
    pub fn document(
        content_hmac: ContentHash,
        algorithm_version: i32,
        params_fingerprint: impl Into<String>,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            content_hmac,
            algorithm_version,
            params_fingerprint: params_fingerprint.into(),
            kind,
            page_number: None,
            sub_index: None,
        }
    }

    /// Key for a per-page artifact.
    pub fn page(
        content_hmac: ContentHash,
        algorithm_version: i32,
        params_fingerprint: impl Into<String>,
        kind: ArtifactKind,
        page_number: i32,
    ) -> Self {
        Self {
            content_hmac,
            algorithm_version,
            params_fingerprint: params_fingerprint.into(),
            kind,
            page_number: Some(page_number),
            sub_index: None,
        }
    }

    /// Stable display form for logs and error messages.
    pub fn display_key(&self) -> String {
        let mut key = format!(
            "{}/v{}/{}/{}",
            hex::encode(self.content_hmac),
            self.algorithm_version,
            self.params_fingerprint,
            self.kind
        );
        if let Some(page) = self.page_number {
            key.push_str(&format!("/p{}", page));
        }
        if let Some(sub) = self.sub_index {
            key.push_str(&format!("/s{}", sub));
        }
        key
    }
}

/// Immutable derived artifact. Created once per distinct content + algorithm
/// version; never mutated; deleted only by explicit retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentArtifact {
    pub artifact_id: EntityId,
    pub key: ArtifactKey,
    /// Pointer into the payload store.
    pub payload_uri: String,
    pub payload: RawContent,
    /// SHA-256 of `payload` for integrity verification.
    pub payload_digest: ContentHash,
    pub size_bytes: i64,
    pub created_at: Timestamp,
}

impl ContentArtifact {
    /// Build an artifact from a payload, deriving digest, size, and URI.
    pub fn from_payload(key: ArtifactKey, payload: RawContent, created_at: Timestamp) -> Self {
        let payload_digest = compute_content_digest(&payload);
        let payload_uri = format!("cas://{}", key.display_key());
        let size_bytes = payload.len() as i64;
        Self {
            artifact_id: crate::new_entity_id(),
            key,
            payload_uri,
            payload,
            payload_digest,
            size_bytes,
            created_at,
        }
    }

    /// Cheap reference view of this artifact.
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            artifact_id: self.artifact_id,
            key: self.key.clone(),
            payload_digest: self.payload_digest,
        }
    }
}

/// Reference to a stored artifact, returned by `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub artifact_id: EntityId,
    pub key: ArtifactKey,
    pub payload_digest: ContentHash,
}

// ============================================================================
// ANALYSIS CACHE
// ============================================================================

/// Key of the single authoritative analysis per content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisKey {
    pub content_hash: ContentHash,
    pub agent_version: String,
}

impl AnalysisKey {
    pub fn new(content_hash: ContentHash, agent_version: impl Into<String>) -> Self {
        Self {
            content_hash,
            agent_version: agent_version.into(),
        }
    }

    pub fn display_key(&self) -> String {
        format!("{}/{}", hex::encode(self.content_hash), self.agent_version)
    }
}

/// The shared analysis record. At most one exists per key; it is never
/// deleted while a live possession references its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub analysis_id: EntityId,
    pub key: AnalysisKey,
    pub status: AnalysisStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Task currently (or last) producing this record.
    pub task_id: Option<TaskId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl AnalysisRecord {
    pub fn new_pending(key: AnalysisKey, now: Timestamp) -> Self {
        Self {
            analysis_id: crate::new_entity_id(),
            key,
            status: AnalysisStatus::Pending,
            result: None,
            error: None,
            task_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ============================================================================
// POSSESSION LEDGER
// ============================================================================

/// Per-user proof of entitlement to read a shared content hash.
///
/// The only entity with a per-user foreign key into the shared domain.
/// Read-only after creation except for the `viewed_at` refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PossessionRecord {
    pub possession_id: EntityId,
    pub user_id: UserId,
    pub content_hash: ContentHash,
    pub source: PossessionSource,
    pub granted_at: Timestamp,
    pub viewed_at: Option<Timestamp>,
}

impl PossessionRecord {
    pub fn new(
        user_id: UserId,
        content_hash: ContentHash,
        source: PossessionSource,
        now: Timestamp,
    ) -> Self {
        Self {
            possession_id: crate::new_entity_id(),
            user_id,
            content_hash,
            source,
            granted_at: now,
            viewed_at: None,
        }
    }
}

/// A user's own progress-tracking record for a requested analysis.
///
/// Cancellation mutates this record only; the shared AnalysisRecord is left
/// untouched because other possessors may rely on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRequest {
    pub request_id: EntityId,
    pub user_id: UserId,
    pub content_hash: ContentHash,
    pub agent_version: String,
    pub status: AnalysisStatus,
    pub cancelled_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl UserRequest {
    pub fn new(
        user_id: UserId,
        content_hash: ContentHash,
        agent_version: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            request_id: crate::new_entity_id(),
            user_id,
            content_hash,
            agent_version: agent_version.into(),
            status: AnalysisStatus::Pending,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == AnalysisStatus::Cancelled
    }
}

// ============================================================================
// TASK REGISTRY
// ============================================================================

/// One edge of the append-only task state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub at: Timestamp,
    pub progress: Option<f32>,
}

/// Registry entry tracking one asynchronous task's lifecycle.
///
/// Mutated only through the transition operation; retained after completion
/// for audit until the retention sweep removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistryEntry {
    pub task_id: TaskId,
    pub task_name: String,
    pub current_state: TaskState,
    pub previous_state: Option<TaskState>,
    pub state_history: Vec<StateTransition>,
    pub progress_percent: f32,
    /// Last-known resumable state, mirrored from the newest checkpoint.
    pub checkpoint_data: Option<serde_json::Value>,
    pub last_heartbeat: Timestamp,
    pub retry_count: i32,
    pub max_retries: i32,
    pub recovery_priority: i32,
    pub auto_recovery_enabled: bool,
    /// The analysis this task is producing, if any.
    pub analysis_key: Option<AnalysisKey>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

// ============================================================================
// CHECKPOINT STORE
// ============================================================================

/// Durable, named recovery point. Superseded by newer checkpoints, never
/// overwritten; `(task_id, name)` is intentionally not unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: EntityId,
    pub task_id: TaskId,
    pub name: String,
    pub progress_percent: f32,
    /// Opaque blob sufficient to resume the task without redoing prior work.
    pub recoverable_data: serde_json::Value,
    /// Snapshot of referenced external-record identifiers.
    pub external_refs: Vec<EntityId>,
    /// SHA-256 over the canonical payload encoding; verified on resume.
    pub integrity_hash: ContentHash,
    pub created_at: Timestamp,
}

impl Checkpoint {
    /// Compute the integrity hash over a checkpoint's own content.
    ///
    /// The encoding is the canonical JSON of (task_id, name, progress,
    /// recoverable_data); serde_json's sorted object keys keep it stable.
    pub fn compute_integrity(
        task_id: &str,
        name: &str,
        progress_percent: f32,
        recoverable_data: &serde_json::Value,
    ) -> ContentHash {
        let canonical = serde_json::json!({
            "task_id": task_id,
            "name": name,
            "progress": format!("{:.4}", progress_percent),
            "data": recoverable_data,
        });
        compute_content_digest(canonical.to_string().as_bytes())
    }

    /// Recompute and compare this checkpoint's integrity hash.
    pub fn verify_integrity(&self) -> bool {
        Self::compute_integrity(
            &self.task_id,
            &self.name,
            self.progress_percent,
            &self.recoverable_data,
        ) == self.integrity_hash
    }
}

// ============================================================================
// RECOVERY QUEUE
// ============================================================================

/// A scheduled recovery attempt for a stalled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryQueueEntry {
    pub entry_id: EntityId,
    pub task_id: TaskId,
    pub method: RecoveryMethod,
    pub scheduled_for: Timestamp,
    pub status: RecoveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RecoveryQueueEntry {
    pub fn new(
        task_id: TaskId,
        method: RecoveryMethod,
        scheduled_for: Timestamp,
        max_attempts: i32,
        now: Timestamp,
    ) -> Self {
        Self {
            entry_id: crate::new_entity_id(),
            task_id,
            method,
            scheduled_for,
            status: RecoveryStatus::Scheduled,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_content_hmac;
    use chrono::Utc;

    fn hmac() -> ContentHash {
        compute_content_hmac(b"test-key", b"contract bytes")
    }

    #[test]
    fn test_artifact_key_display_includes_page() {
        let key = ArtifactKey::page(hmac(), 2, "fp", ArtifactKind::PageText, 4);
        let display = key.display_key();
        assert!(display.contains("/v2/"));
        assert!(display.contains("page_text"));
        assert!(display.ends_with("/p4"));
    }

    #[test]
    fn test_artifact_keys_differ_by_version() {
        let a = ArtifactKey::document(hmac(), 1, "fp", ArtifactKind::FullText);
        let b = ArtifactKey::document(hmac(), 2, "fp", ArtifactKind::FullText);
        assert_ne!(a, b);
    }

    #[test]
    fn test_artifact_from_payload_derives_digest() {
        let key = ArtifactKey::document(hmac(), 1, "fp", ArtifactKind::FullText);
        let artifact =
            ContentArtifact::from_payload(key, b"extracted text".to_vec(), Utc::now());
        assert_eq!(artifact.payload_digest, compute_content_digest(b"extracted text"));
        assert_eq!(artifact.size_bytes, 14);
        assert!(artifact.payload_uri.starts_with("cas://"));
    }

    #[test]
    fn test_checkpoint_integrity_roundtrip() {
        let data = serde_json::json!({"step": "entities_extracted", "cursor": 42});
        let hash = Checkpoint::compute_integrity("t-1", "step2", 50.0, &data);
        let checkpoint = Checkpoint {
            checkpoint_id: crate::new_entity_id(),
            task_id: "t-1".to_string(),
            name: "step2".to_string(),
            progress_percent: 50.0,
            recoverable_data: data,
            external_refs: vec![],
            integrity_hash: hash,
            created_at: Utc::now(),
        };
        assert!(checkpoint.verify_integrity());
    }

    #[test]
    fn test_checkpoint_integrity_detects_tampering() {
        let data = serde_json::json!({"step": "one"});
        let hash = Checkpoint::compute_integrity("t-1", "step1", 10.0, &data);
        let mut checkpoint = Checkpoint {
            checkpoint_id: crate::new_entity_id(),
            task_id: "t-1".to_string(),
            name: "step1".to_string(),
            progress_percent: 10.0,
            recoverable_data: data,
            external_refs: vec![],
            integrity_hash: hash,
            created_at: Utc::now(),
        };
        checkpoint.recoverable_data = serde_json::json!({"step": "corrupted"});
        assert!(!checkpoint.verify_integrity());
    }

    #[test]
    fn test_user_request_starts_pending() {
        let request = UserRequest::new(crate::new_entity_id(), hmac(), "v1", Utc::now());
        assert_eq!(request.status, AnalysisStatus::Pending);
        assert!(!request.is_cancelled());
        assert!(request.cancelled_at.is_none());
    }

    #[test]
    fn test_analysis_key_display() {
        let key = AnalysisKey::new(hmac(), "v1");
        assert!(key.display_key().ends_with("/v1"));
    }
}
