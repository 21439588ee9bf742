//! State machine transition tables.
//!
//! The tables are the single source of truth for transition legality. The
//! storage and service layers call into these; neither encodes its own rules.
//!
//! Analysis cache:
//!
//! ```text
//! pending ──→ processing ──→ completed
//!    │             │────────→ failed
//!    │             └────────→ cancelled
//!    └──→ cancelled
//! ```
//!
//! Task registry:
//!
//! ```text
//! queued → started → processing ⇄ checkpoint
//!                        │ paused, completed, failed, cancelled
//!                        │ partial, orphaned (sweep-assigned)
//! partial/orphaned → recovering → processing
//! ```

use crate::enums::{AnalysisStatus, TaskState};

impl AnalysisStatus {
    /// Whether the analysis state machine permits `self -> next`.
    ///
    /// Retry of a failed/cancelled analysis goes back through `Pending`.
    /// Nothing leaves `Completed`: completed analyses are never reset.
    pub fn can_transition_to(self, next: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl TaskState {
    /// Whether the task state machine permits `self -> next`.
    ///
    /// `Processing -> Processing` and `Checkpoint -> Checkpoint` are legal so
    /// progress updates flow through the same transition operation as state
    /// changes and land in the same audit history.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Queued => matches!(next, Started | Cancelled | Orphaned),
            Started => matches!(next, Processing | Failed | Cancelled | Orphaned),
            Processing => matches!(
                next,
                Processing
                    | Checkpoint
                    | Paused
                    | Completed
                    | Failed
                    | Cancelled
                    | Partial
                    | Orphaned
            ),
            Checkpoint => matches!(
                next,
                Processing
                    | Checkpoint
                    | Paused
                    | Completed
                    | Failed
                    | Cancelled
                    | Partial
                    | Orphaned
            ),
            Paused => matches!(next, Processing | Cancelled | Failed | Orphaned),
            Recovering => matches!(next, Processing | Completed | Failed | Partial | Orphaned),
            Partial => matches!(next, Recovering | Completed | Failed | Cancelled),
            Orphaned => matches!(next, Recovering | Completed | Failed | Cancelled),
            // Terminal states admit nothing.
            Completed | Failed | Cancelled => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
