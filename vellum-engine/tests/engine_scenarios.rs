//! End-to-end scenarios across the engine, cache, registry, and recovery.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use vellum_engine::{AnalysisOutcome, Engine};
use vellum_recovery::{RecoveryConfig, RecoveryOrchestrator};
use vellum_tasks::{CheckpointLog, TaskRegistry};
use vellum_test_utils::{test_config, test_hash, MemoryStorage, RecordingSink, TaskState, VellumError};

fn engine() -> (Engine<MemoryStorage>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::new(storage.clone(), test_config()).expect("valid config");
    (engine, storage)
}

/// The canonical sharing scenario: A computes, B shares the result without
/// a new task, C is denied without learning anything.
#[test]
fn shared_analysis_across_unrelated_users() {
    let (engine, _) = engine();
    let now = Utc::now();
    let h1 = test_hash("identical contract bytes");

    let user_a = vellum_test_utils::new_entity_id();
    let user_b = vellum_test_utils::new_entity_id();
    let user_c = vellum_test_utils::new_entity_id();

    let sink = Arc::new(RecordingSink::new());
    engine.add_progress_sink(sink.clone());

    // User A submits content and requests analysis: cache miss, task t1.
    engine.register_upload(user_a, h1, now).unwrap();
    let outcome_a = engine.request_analysis(user_a, h1, "v1", now).unwrap();
    assert!(!outcome_a.cache_hit);
    let t1 = outcome_a.task_id.clone().unwrap();

    // The task runs: queued -> started -> processing, checkpoints at 50%,
    // completes with the result.
    engine.begin_task(&t1, now).unwrap();
    engine
        .checkpoint_task(&t1, "entities_extracted", 50.0, serde_json::json!({"step": 2}), now)
        .unwrap();
    engine
        .complete_task(&t1, serde_json::json!({"score": 7.2}), now)
        .unwrap();

    // User B uploads byte-identical content, hashing to the same h1.
    engine.register_upload(user_b, h1, now).unwrap();
    let outcome_b = engine.request_analysis(user_b, h1, "v1", now).unwrap();

    // Cache hit: same analysis, no new task.
    assert!(outcome_b.cache_hit);
    assert_eq!(outcome_b.analysis_id, outcome_a.analysis_id);

    // B holds a possession record and reads the shared result.
    assert!(engine.ledger().has_possession(user_b, &h1).unwrap());
    match engine.get_result(user_b, h1, "v1", now).unwrap() {
        AnalysisOutcome::Ready { result, .. } => assert_eq!(result["score"], 7.2),
        other => panic!("expected Ready, got {:?}", other),
    }

    // User C never submitted or was granted h1: denied, identically to a
    // hash that does not exist at all.
    let denied = engine.get_result(user_c, h1, "v1", now).unwrap_err();
    assert!(matches!(denied, VellumError::Access(_)));
    let absent = engine
        .get_result(user_c, test_hash("never uploaded"), "v1", now)
        .unwrap_err();
    assert_eq!(format!("{}", denied), format!("{}", absent));

    // Exactly one task ran, and progress events flowed for it.
    let states = sink.states();
    assert!(states.contains(&TaskState::Processing));
    assert!(states.contains(&TaskState::Completed));
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == TaskState::Completed)
            .count(),
        1
    );
}

/// Crash recovery end to end: worker dies after checkpoint "step2"; the
/// sweep resumes from that checkpoint, not from the beginning.
#[test]
fn crashed_task_resumes_from_checkpoint_through_engine() {
    let (engine, storage) = engine();
    let t0 = Utc::now();
    let h1 = test_hash("contract");
    let user = vellum_test_utils::new_entity_id();

    engine.register_upload(user, h1, t0).unwrap();
    let outcome = engine.request_analysis(user, h1, "v1", t0).unwrap();
    let task_id = outcome.task_id.unwrap();
    engine.begin_task(&task_id, t0).unwrap();
    engine
        .checkpoint_task(&task_id, "step1", 25.0, serde_json::json!({"cursor": 10}), t0)
        .unwrap();
    engine
        .checkpoint_task(
            &task_id,
            "step2",
            50.0,
            serde_json::json!({"cursor": 42}),
            t0 + ChronoDuration::seconds(30),
        )
        .unwrap();
    // ... and the worker crashes here.

    let orchestrator = RecoveryOrchestrator::new(
        storage.clone(),
        TaskRegistry::new(storage.clone()),
        CheckpointLog::new(storage.clone(), 20),
        vellum_cache_handle(&storage),
        RecoveryConfig::development(),
    );

    let report = orchestrator.run_sweep_once(t0 + ChronoDuration::minutes(10));
    assert_eq!(report.discovered, 1);
    assert_eq!(report.processed, 1);

    let task = engine.registry().get(&task_id).unwrap().unwrap();
    assert_eq!(task.current_state, TaskState::Processing);
    assert_eq!(task.progress_percent, 50.0);
    assert_eq!(
        task.checkpoint_data,
        Some(serde_json::json!({"cursor": 42}))
    );

    // A worker picks the re-armed task back up and finishes.
    engine
        .complete_task(&task_id, serde_json::json!({"score": 9.1}), t0 + ChronoDuration::minutes(11))
        .unwrap();
    assert!(engine
        .get_result(user, h1, "v1", t0 + ChronoDuration::minutes(11))
        .unwrap()
        .is_ready());
}

fn vellum_cache_handle(storage: &Arc<MemoryStorage>) -> vellum_cache::AnalysisCache<MemoryStorage> {
    vellum_cache::AnalysisCache::new(storage.clone(), 3)
}
