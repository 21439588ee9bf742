//! VELLUM Test Utilities
//!
//! Centralized test infrastructure for the VELLUM workspace:
//! - Fixtures for entities and a fully wired engine
//! - Proptest generators for enums and keys
//! - A recording progress sink for event assertions

use std::sync::{Arc, Mutex};
use std::time::Duration;

// Re-export storage and core types for convenience
pub use vellum_core::{
    compute_content_digest, compute_content_hmac, compute_params_fingerprint, new_entity_id,
    AnalysisKey, AnalysisRecord, AnalysisStatus, ArtifactKey, ArtifactKind, Checkpoint,
    ContentArtifact, ContentHash, PossessionRecord, PossessionSource, RecoveryMethod,
    RecoveryQueueEntry, RecoveryStatus, StateTransition, TaskRegistryEntry, TaskState, Timestamp,
    UserId, UserRequest, VellumConfig, VellumError, VellumResult,
};
pub use vellum_storage::MemoryStorage;

use vellum_engine::Engine;
use vellum_tasks::{ProgressEvent, ProgressSink};

/// HMAC key used for content addressing in tests.
pub const TEST_HMAC_KEY: &[u8] = b"vellum-test-key";

/// Deterministic content hash for a label.
pub fn test_hash(label: &str) -> ContentHash {
    compute_content_hmac(TEST_HMAC_KEY, label.as_bytes())
}

/// A config with test-friendly but valid bounds.
pub fn test_config() -> VellumConfig {
    VellumConfig {
        heartbeat_interval: Duration::from_secs(5),
        staleness_threshold: Duration::from_secs(300),
        upsert_retry_attempts: 3,
        default_max_retries: 3,
        default_recovery_max_attempts: 3,
        checkpoint_retention: 20,
        task_retention: Duration::from_secs(86400 * 30),
    }
}

/// An engine over fresh in-memory storage, plus the storage handle for
/// poking at raw state in assertions.
pub fn test_engine() -> (Engine<MemoryStorage>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::new(storage.clone(), test_config()).expect("test config is valid");
    (engine, storage)
}

/// A registry entry fixture in the given state.
pub fn make_task(task_id: &str, state: TaskState, now: Timestamp) -> TaskRegistryEntry {
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

/// Progress sink that records every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<TaskState> {
        self.events().iter().map(|e| e.state).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_task_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Queued),
            Just(TaskState::Started),
            Just(TaskState::Processing),
            Just(TaskState::Checkpoint),
            Just(TaskState::Paused),
            Just(TaskState::Completed),
            Just(TaskState::Failed),
            Just(TaskState::Cancelled),
            Just(TaskState::Recovering),
            Just(TaskState::Partial),
            Just(TaskState::Orphaned),
        ]
    }

    pub fn arb_analysis_status() -> impl Strategy<Value = AnalysisStatus> {
        prop_oneof![
            Just(AnalysisStatus::Pending),
            Just(AnalysisStatus::Processing),
            Just(AnalysisStatus::Completed),
            Just(AnalysisStatus::Failed),
            Just(AnalysisStatus::Cancelled),
        ]
    }

    pub fn arb_possession_source() -> impl Strategy<Value = PossessionSource> {
        prop_oneof![
            Just(PossessionSource::OriginUpload),
            Just(PossessionSource::CacheHit),
            Just(PossessionSource::SharedView),
        ]
    }

    pub fn arb_content_hash() -> impl Strategy<Value = ContentHash> {
        prop::collection::vec(any::<u8>(), 1..128)
            .prop_map(|bytes| compute_content_hmac(TEST_HMAC_KEY, &bytes))
    }

    pub fn arb_artifact_key() -> impl Strategy<Value = ArtifactKey> {
        (
            arb_content_hash(),
            1..5i32,
            prop_oneof![
                Just(ArtifactKind::FullText),
                Just(ArtifactKind::PageText),
                Just(ArtifactKind::Diagram),
                Just(ArtifactKind::Paragraph),
            ],
            prop::option::of(0..50i32),
        )
            .prop_map(|(content_hmac, algorithm_version, kind, page_number)| ArtifactKey {
                content_hmac,
                algorithm_version,
                params_fingerprint: "fp-default".to_string(),
                kind,
                page_number,
                sub_index: None,
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_hash_is_deterministic() {
        assert_eq!(test_hash("doc"), test_hash("doc"));
        assert_ne!(test_hash("doc"), test_hash("other"));
    }

    #[test]
    fn test_test_config_is_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_test_engine_builds() {
        let (engine, storage) = test_engine();
        assert_eq!(storage.task_count(), 0);
        assert_eq!(
            engine.config().heartbeat_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_recording_sink_collects() {
        let sink = RecordingSink::new();
        sink.on_progress(&ProgressEvent {
            task_id: "t-1".to_string(),
            state: TaskState::Processing,
            progress_percent: 10.0,
            step_description: "step".to_string(),
        });
        assert_eq!(sink.states(), vec![TaskState::Processing]);
    }
}
