//! Enum types with database string round-trips.
//!
//! Every enum persisted as a string carries `as_db_str`/`from_db_str` plus
//! `Display`/`FromStr`, so the storage layer never invents its own spelling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity kind discriminator for storage errors and polymorphic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Artifact,
    Analysis,
    Possession,
    UserRequest,
    Task,
    Checkpoint,
    RecoveryEntry,
}

/// Kind of derived artifact stored per content address.
///
/// All kinds share the same addressing scheme; the kind is the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// Full extracted text of the document
    FullText,
    /// Per-page extracted text
    PageText,
    /// Extracted diagram/figure
    Diagram,
    /// Individual paragraph
    Paragraph,
}

impl ArtifactKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ArtifactKind::FullText => "full_text",
            ArtifactKind::PageText => "page_text",
            ArtifactKind::Diagram => "diagram",
            ArtifactKind::Paragraph => "paragraph",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "full_text" => Ok(ArtifactKind::FullText),
            "page_text" => Ok(ArtifactKind::PageText),
            "diagram" => Ok(ArtifactKind::Diagram),
            "paragraph" => Ok(ArtifactKind::Paragraph),
            _ => Err(EnumParseError::new("ArtifactKind", s)),
        }
    }
}

/// Status of a shared analysis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Cancelled
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            "cancelled" => Ok(AnalysisStatus::Cancelled),
            _ => Err(EnumParseError::new("AnalysisStatus", s)),
        }
    }
}

/// Lifecycle state of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Started,
    Processing,
    /// Stable sub-state of Processing reached after each durable checkpoint write.
    Checkpoint,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Recovering,
    /// Heartbeat went stale mid-work; some output may exist.
    Partial,
    /// Heartbeat went stale with no terminal transition recorded.
    Orphaned,
}

impl TaskState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States a task may be registered in.
    pub fn is_initial(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Started)
    }

    /// States in which the registry expects a fresh heartbeat. A stale
    /// heartbeat in any of these makes the task eligible for the recovery
    /// sweep; that covers workers that die mid-recovery too.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering
        )
    }

    /// Diagnostic states assigned by the recovery sweep.
    pub fn is_stranded(&self) -> bool {
        matches!(self, TaskState::Partial | TaskState::Orphaned)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Started => "started",
            TaskState::Processing => "processing",
            TaskState::Checkpoint => "checkpoint",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Recovering => "recovering",
            TaskState::Partial => "partial",
            TaskState::Orphaned => "orphaned",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "started" => Ok(TaskState::Started),
            "processing" => Ok(TaskState::Processing),
            "checkpoint" => Ok(TaskState::Checkpoint),
            "paused" => Ok(TaskState::Paused),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            "recovering" => Ok(TaskState::Recovering),
            "partial" => Ok(TaskState::Partial),
            "orphaned" => Ok(TaskState::Orphaned),
            _ => Err(EnumParseError::new("TaskState", s)),
        }
    }
}

/// How a stalled task is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryMethod {
    /// Load the latest valid checkpoint and replay from its recoverable data.
    ResumeCheckpoint,
    /// Discard checkpoints and rerun from scratch.
    RestartClean,
    /// Re-verify completion without side effects.
    ValidateOnly,
    /// Surface to an operator queue; no automatic action.
    ManualIntervention,
}

impl RecoveryMethod {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RecoveryMethod::ResumeCheckpoint => "resume_checkpoint",
            RecoveryMethod::RestartClean => "restart_clean",
            RecoveryMethod::ValidateOnly => "validate_only",
            RecoveryMethod::ManualIntervention => "manual_intervention",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "resume_checkpoint" => Ok(RecoveryMethod::ResumeCheckpoint),
            "restart_clean" => Ok(RecoveryMethod::RestartClean),
            "validate_only" => Ok(RecoveryMethod::ValidateOnly),
            "manual_intervention" => Ok(RecoveryMethod::ManualIntervention),
            _ => Err(EnumParseError::new("RecoveryMethod", s)),
        }
    }
}

/// Status of a recovery queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    /// The work completed through another path; nothing to recover.
    Resolved,
}

impl RecoveryStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, RecoveryStatus::Scheduled | RecoveryStatus::InProgress)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Scheduled => "scheduled",
            RecoveryStatus::InProgress => "in_progress",
            RecoveryStatus::Succeeded => "succeeded",
            RecoveryStatus::Failed => "failed",
            RecoveryStatus::Resolved => "resolved",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "scheduled" => Ok(RecoveryStatus::Scheduled),
            "in_progress" => Ok(RecoveryStatus::InProgress),
            "succeeded" => Ok(RecoveryStatus::Succeeded),
            "failed" => Ok(RecoveryStatus::Failed),
            "resolved" => Ok(RecoveryStatus::Resolved),
            _ => Err(EnumParseError::new("RecoveryStatus", s)),
        }
    }
}

/// How a user came to possess a content hash.
///
/// Audit/analytics only; all sources grant equal read rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PossessionSource {
    /// User uploaded the content themselves.
    OriginUpload,
    /// User requested analysis of content someone else had already computed.
    CacheHit,
    /// User was granted view of a result by an explicit share.
    SharedView,
}

impl PossessionSource {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PossessionSource::OriginUpload => "origin_upload",
            PossessionSource::CacheHit => "cache_hit",
            PossessionSource::SharedView => "shared_view",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "origin_upload" => Ok(PossessionSource::OriginUpload),
            "cache_hit" => Ok(PossessionSource::CacheHit),
            "shared_view" => Ok(PossessionSource::SharedView),
            _ => Err(EnumParseError::new("PossessionSource", s)),
        }
    }
}

// ============================================================================
// DISPLAY / FROMSTR
// ============================================================================

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub type_name: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(type_name: &'static str, value: &str) -> Self {
        Self {
            type_name,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {} value: {}", self.type_name, self.value)
    }
}

impl std::error::Error for EnumParseError {}

macro_rules! impl_display_fromstr {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.as_db_str())
                }
            }

            impl FromStr for $ty {
                type Err = EnumParseError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Self::from_db_str(s)
                }
            }
        )*
    };
}

impl_display_fromstr!(
    ArtifactKind,
    AnalysisStatus,
    TaskState,
    RecoveryMethod,
    RecoveryStatus,
    PossessionSource
);

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_status_roundtrip() {
        for status in [
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisStatus::Failed,
            AnalysisStatus::Cancelled,
        ] {
            assert_eq!(AnalysisStatus::from_db_str(status.as_db_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_task_state_roundtrip() {
        for state in [
            TaskState::Queued,
            TaskState::Started,
            TaskState::Processing,
            TaskState::Checkpoint,
            TaskState::Paused,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
            TaskState::Recovering,
            TaskState::Partial,
            TaskState::Orphaned,
        ] {
            assert_eq!(TaskState::from_db_str(state.as_db_str()).unwrap(), state);
            assert_eq!(state.to_string().parse::<TaskState>().unwrap(), state);
        }
    }

    #[test]
    fn test_invalid_db_str_rejected() {
        assert!(TaskState::from_db_str("exploded").is_err());
        assert!(AnalysisStatus::from_db_str("Pending").is_err());
        let err = RecoveryMethod::from_db_str("retry").unwrap_err();
        assert!(err.to_string().contains("RecoveryMethod"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Checkpoint.is_terminal());
        assert!(!TaskState::Orphaned.is_terminal());

        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(!AnalysisStatus::Processing.is_terminal());
    }

    #[test]
    fn test_live_and_stranded_classification() {
        assert!(TaskState::Processing.is_live());
        assert!(TaskState::Checkpoint.is_live());
        assert!(!TaskState::Paused.is_live());
        assert!(TaskState::Partial.is_stranded());
        assert!(TaskState::Orphaned.is_stranded());
        assert!(!TaskState::Processing.is_stranded());
    }

    #[test]
    fn test_recovery_status_open() {
        assert!(RecoveryStatus::Scheduled.is_open());
        assert!(RecoveryStatus::InProgress.is_open());
        assert!(!RecoveryStatus::Resolved.is_open());
        assert!(!RecoveryStatus::Failed.is_open());
    }
}
