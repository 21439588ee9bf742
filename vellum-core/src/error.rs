//! Error types for VELLUM operations.
//!
//! Absence is not failure: lookups return `Option` and callers branch on it.
//! The variants here cover genuine contract violations and infrastructure
//! faults. `AccessDenied` carries no hint of whether the target exists.

use crate::enums::{AnalysisStatus, EntityKind, TaskState};
use crate::{TaskId, UserId};
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind:?} with key {key}")]
    NotFound { kind: EntityKind, key: String },

    #[error("Duplicate key for {kind:?}: {key}")]
    DuplicateKey { kind: EntityKind, key: String },

    #[error("Digest collision at {key}: stored {stored}, offered {offered}")]
    DigestCollision {
        key: String,
        stored: String,
        offered: String,
    },

    #[error("Write conflict on {key} not resolved after {attempts} attempts")]
    ConflictRetryExhausted { key: String, attempts: u32 },

    #[error("Unknown task: {task_id}")]
    UnknownTask { task_id: TaskId },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Access gate errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    /// Identical for "no such record" and "record exists but not yours".
    #[error("Access denied for user {user_id}")]
    AccessDenied { user_id: UserId },
}

/// State machine contract violations. Always fatal to the call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid analysis transition: {from:?} -> {to:?}")]
    InvalidAnalysis {
        from: AnalysisStatus,
        to: AnalysisStatus,
    },

    #[error("Invalid task transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTask {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

/// Checkpoint integrity errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Checkpoint {checkpoint_id} failed integrity verification")]
    IntegrityMismatch { checkpoint_id: uuid::Uuid },

    #[error("No valid checkpoint for task {task_id}")]
    NoValidCheckpoint { task_id: TaskId },
}

/// Recovery orchestration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Recovery retries exhausted for task {task_id} after {attempts} attempts")]
    RetryExhausted { task_id: TaskId, attempts: i32 },

    #[error("Task {task_id} in state {state:?} is not eligible for recovery")]
    NotEligible { task_id: TaskId, state: TaskState },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all VELLUM errors.
#[derive(Debug, Clone, Error)]
pub enum VellumError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for VELLUM operations.
pub type VellumResult<T> = Result<T, VellumError>;

// ============================================================================
// TESTS
// ============================================================================
