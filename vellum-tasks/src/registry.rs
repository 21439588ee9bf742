//! Task registry: lifecycle tracking with an append-only audit history.

use std::sync::{Arc, RwLock};

use vellum_core::{
    AnalysisKey, StateTransition, TaskId, TaskRegistryEntry, TaskState, Timestamp,
    TransitionError, VellumError, VellumResult,
};
use vellum_storage::{StorageTrait, TaskTransition};

/// Progress event emitted after each committed transition.
///
/// Collaborators (UI polling, websocket fan-out) subscribe via
/// `ProgressSink`; the hook is explicit and runs post-commit so ordering
/// and idempotence are visible in code, not hidden in storage triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub progress_percent: f32,
    pub step_description: String,
}

/// Observer of task progress.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Parameters for registering a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Caller-supplied opaque unique token.
    pub task_id: TaskId,
    pub task_name: String,
    /// Must be an initial state (`Queued` or `Started`).
    pub initial_state: TaskState,
    pub max_retries: i32,
    pub recovery_priority: i32,
    pub auto_recovery_enabled: bool,
    /// The analysis this task produces, if any.
    pub analysis_key: Option<AnalysisKey>,
}

impl NewTask {
    pub fn queued(task_id: impl Into<TaskId>, task_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            initial_state: TaskState::Queued,
            max_retries: 3,
            recovery_priority: 0,
            auto_recovery_enabled: true,
            analysis_key: None,
        }
    }

    pub fn with_analysis(mut self, key: AnalysisKey) -> Self {
        self.analysis_key = Some(key);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.recovery_priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Optional fields accompanying a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    pub progress: Option<f32>,
    pub checkpoint_data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub step_description: Option<String>,
    /// Set by recovery attempts; bumps the entry's retry counter.
    pub bump_retry: bool,
}

impl TransitionOptions {
    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step_description = Some(step.into());
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
}

/// Task registry service.
pub struct TaskRegistry<S: StorageTrait> {
    storage: Arc<S>,
    sinks: RwLock<Vec<Arc<dyn ProgressSink>>>,
}

impl<S: StorageTrait> Clone for TaskRegistry<S> {
    fn clone(&self) -> Self {
        let sinks = self
            .sinks
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        Self {
            storage: Arc::clone(&self.storage),
            sinks: RwLock::new(sinks),
        }
    }
}

impl<S: StorageTrait> TaskRegistry<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe an observer to committed transitions.
    pub fn add_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    /// Register a new task in an initial state.
    pub fn register(&self, spec: NewTask, now: Timestamp) -> VellumResult<TaskRegistryEntry> {
        if !spec.initial_state.is_initial() {
            return Err(VellumError::Transition(TransitionError::InvalidTask {
                task_id: spec.task_id.clone(),
                from: spec.initial_state,
                to: spec.initial_state,
            }));
        }
        let entry = TaskRegistryEntry {
            task_id: spec.task_id,
            task_name: spec.task_name,
            current_state: spec.initial_state,
            previous_state: None,
            state_history: vec![StateTransition {
                from: None,
                to: spec.initial_state,
                at: now,
                progress: None,
            }],
            progress_percent: 0.0,
            checkpoint_data: None,
            last_heartbeat: now,
            retry_count: 0,
            max_retries: spec.max_retries,
            recovery_priority: spec.recovery_priority,
            auto_recovery_enabled: spec.auto_recovery_enabled,
            analysis_key: spec.analysis_key,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: if spec.initial_state == TaskState::Started {
                Some(now)
            } else {
                None
            },
            completed_at: None,
        };
        self.storage.task_insert(&entry)?;
        Ok(entry)
    }

    /// Get a registry entry.
    pub fn get(&self, task_id: &str) -> VellumResult<Option<TaskRegistryEntry>> {
        self.storage.task_get(task_id)
    }

    /// The only mutator. Validates the transition against the state table,
    /// applies it atomically, and notifies observers after the commit.
    ///
    /// Fails with `UnknownTask` for unregistered ids and `InvalidTask` for
    /// illegal transitions - including the case where a racing worker moved
    /// the entry between our read and write.
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskState,
        opts: TransitionOptions,
        now: Timestamp,
    ) -> VellumResult<TaskRegistryEntry> {
        let entry = self.storage.task_get(task_id)?.ok_or_else(|| {
            VellumError::Storage(vellum_core::StorageError::UnknownTask {
                task_id: task_id.to_string(),
            })
        })?;

        let from = entry.current_state;
        if !from.can_transition_to(to) {
            return Err(VellumError::Transition(TransitionError::InvalidTask {
                task_id: task_id.to_string(),
                from,
                to,
            }));
        }

        let mut transition = TaskTransition::to(to, now);
        transition.progress = opts.progress;
        transition.checkpoint_data = opts.checkpoint_data.clone();
        transition.error = opts.error.clone();
        transition.result = opts.result.clone();
        transition.bump_retry = opts.bump_retry;

        let updated = self
            .storage
            .task_apply_transition(task_id, from, &transition)?;

        self.notify(&updated, opts.step_description.unwrap_or_default());

        Ok(updated)
    }

    /// Cheap heartbeat refresh while a worker is processing.
    pub fn heartbeat(&self, task_id: &str, now: Timestamp) -> VellumResult<()> {
        self.storage.task_heartbeat(task_id, now)
    }

    /// Retention sweep: drop terminal entries completed before `cutoff`.
    pub fn prune_terminal_before(&self, cutoff: Timestamp) -> VellumResult<usize> {
        let removed = self.storage.task_prune_terminal_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, "Pruned terminal task registry entries");
        }
        Ok(removed)
    }

    fn notify(&self, entry: &TaskRegistryEntry, step_description: String) {
        let event = ProgressEvent {
            task_id: entry.task_id.clone(),
            state: entry.current_state,
            progress_percent: entry.progress_percent,
            step_description,
        };
        if let Ok(sinks) = self.sinks.read() {
            for sink in sinks.iter() {
                sink.on_progress(&event);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use vellum_core::StorageError;
    use vellum_storage::MemoryStorage;

    /// Collects events for assertions.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn registry() -> TaskRegistry<MemoryStorage> {
        TaskRegistry::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_register_queued_task() {
        let registry = registry();
        let entry = registry
            .register(NewTask::queued("t-1", "document_analysis"), Utc::now())
            .unwrap();
        assert_eq!(entry.current_state, TaskState::Queued);
        assert_eq!(entry.state_history.len(), 1);
        assert!(entry.started_at.is_none());
    }

    #[test]
    fn test_register_rejects_non_initial_state() {
        let registry = registry();
        let mut spec = NewTask::queued("t-1", "document_analysis");
        spec.initial_state = TaskState::Processing;
        assert!(registry.register(spec, Utc::now()).is_err());
    }

    #[test]
    fn test_register_duplicate_task_id_rejected() {
        let registry = registry();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), Utc::now())
            .unwrap();
        let err = registry
            .register(NewTask::queued("t-1", "document_analysis"), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Storage(StorageError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_transition_appends_full_audit_trail() {
        let registry = registry();
        let now = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), now)
            .unwrap();

        registry
            .transition("t-1", TaskState::Started, TransitionOptions::default(), now)
            .unwrap();
        registry
            .transition(
                "t-1",
                TaskState::Processing,
                TransitionOptions::progress(25.0).with_step("text extracted"),
                now,
            )
            .unwrap();
        let entry = registry
            .transition(
                "t-1",
                TaskState::Completed,
                TransitionOptions::progress(100.0).with_result(serde_json::json!({"score": 7.2})),
                now,
            )
            .unwrap();

        assert_eq!(entry.state_history.len(), 4);
        let states: Vec<TaskState> = entry.state_history.iter().map(|h| h.to).collect();
        assert_eq!(
            states,
            vec![
                TaskState::Queued,
                TaskState::Started,
                TaskState::Processing,
                TaskState::Completed
            ]
        );
        assert!(entry.started_at.is_some());
        assert!(entry.completed_at.is_some());
        assert_eq!(entry.progress_percent, 100.0);
    }

    #[test]
    fn test_transition_unknown_task() {
        let registry = registry();
        let err = registry
            .transition(
                "ghost",
                TaskState::Started,
                TransitionOptions::default(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Storage(StorageError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let registry = registry();
        let now = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), now)
            .unwrap();

        let err = registry
            .transition("t-1", TaskState::Completed, TransitionOptions::default(), now)
            .unwrap_err();
        assert!(matches!(
            err,
            VellumError::Transition(TransitionError::InvalidTask {
                from: TaskState::Queued,
                to: TaskState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_transition_refreshes_heartbeat() {
        let registry = registry();
        let t0 = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), t0)
            .unwrap();

        let t1 = t0 + chrono::Duration::seconds(30);
        let entry = registry
            .transition("t-1", TaskState::Started, TransitionOptions::default(), t1)
            .unwrap();
        assert_eq!(entry.last_heartbeat, t1);
    }

    #[test]
    fn test_progress_events_reach_sinks_post_commit() {
        let registry = registry();
        let sink = Arc::new(RecordingSink::default());
        registry.add_progress_sink(sink.clone());

        let now = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), now)
            .unwrap();
        registry
            .transition("t-1", TaskState::Started, TransitionOptions::default(), now)
            .unwrap();
        registry
            .transition(
                "t-1",
                TaskState::Processing,
                TransitionOptions::progress(50.0).with_step("entities extracted"),
                now,
            )
            .unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].state, TaskState::Processing);
        assert_eq!(events[1].progress_percent, 50.0);
        assert_eq!(events[1].step_description, "entities extracted");
    }

    #[test]
    fn test_failed_transition_emits_no_event() {
        let registry = registry();
        let sink = Arc::new(RecordingSink::default());
        registry.add_progress_sink(sink.clone());

        let now = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), now)
            .unwrap();
        let _ = registry.transition("t-1", TaskState::Completed, TransitionOptions::default(), now);

        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_does_not_touch_state() {
        let registry = registry();
        let t0 = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), t0)
            .unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        registry.heartbeat("t-1", t1).unwrap();

        let entry = registry.get("t-1").unwrap().unwrap();
        assert_eq!(entry.last_heartbeat, t1);
        assert_eq!(entry.current_state, TaskState::Queued);
        assert_eq!(entry.state_history.len(), 1);
    }

    #[test]
    fn test_retry_bump_recorded() {
        let registry = registry();
        let now = Utc::now();
        registry
            .register(NewTask::queued("t-1", "document_analysis"), now)
            .unwrap();
        registry
            .transition("t-1", TaskState::Started, TransitionOptions::default(), now)
            .unwrap();
        registry
            .transition("t-1", TaskState::Processing, TransitionOptions::default(), now)
            .unwrap();
        registry
            .transition("t-1", TaskState::Orphaned, TransitionOptions::default(), now)
            .unwrap();

        let mut opts = TransitionOptions::default();
        opts.bump_retry = true;
        let entry = registry
            .transition("t-1", TaskState::Recovering, opts, now)
            .unwrap();
        assert_eq!(entry.retry_count, 1);
    }
}
