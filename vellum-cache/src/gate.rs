//! Access gate: the single authorization predicate for shared reads.
//!
//! Every read of an AnalysisRecord, ContentArtifact, or derived view goes
//! through `can_read`. The predicate is an explicit function parameterized
//! by caller identity rather than an ambient security context, so it is
//! unit-testable in isolation and impossible to bypass accidentally -
//! read paths take a `Principal`, not a raw user id.

use std::sync::Arc;

use vellum_core::{AccessError, ContentHash, UserId, VellumError, VellumResult};
use vellum_storage::StorageTrait;

use crate::possession::PossessionLedger;

/// The caller's identity for authorization purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// An end user; reads are gated by their possession records.
    User(UserId),
    /// A trusted backend principal (workers, sweeps). Bypasses the gate.
    Service,
}

/// Access gate over the possession ledger.
pub struct AccessGate<S: StorageTrait> {
    ledger: PossessionLedger<S>,
}

impl<S: StorageTrait> Clone for AccessGate<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
        }
    }
}

impl<S: StorageTrait> AccessGate<S> {
    pub fn new(ledger: PossessionLedger<S>) -> Self {
        Self { ledger }
    }

    /// Whether the principal may read records for this content hash.
    pub fn can_read(&self, principal: Principal, content_hash: &ContentHash) -> VellumResult<bool> {
        match principal {
            Principal::Service => Ok(true),
            Principal::User(user_id) => self.ledger.has_possession(user_id, content_hash),
        }
    }

    /// Enforce the predicate, returning `AccessDenied` when it is false.
    ///
    /// The denial is identical whether the target exists or not; callers
    /// learn nothing about the shared cache from a denial.
    pub fn require_read(
        &self,
        principal: Principal,
        content_hash: &ContentHash,
    ) -> VellumResult<()> {
        match principal {
            Principal::Service => Ok(()),
            Principal::User(user_id) => {
                if self.ledger.has_possession(user_id, content_hash)? {
                    Ok(())
                } else {
                    tracing::debug!(user_id = %user_id, "Read denied by access gate");
                    Err(VellumError::Access(AccessError::AccessDenied { user_id }))
                }
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
    use vellum_core::{compute_content_hmac, PossessionSource};
    use vellum_storage::MemoryStorage;

    fn gate() -> (AccessGate<MemoryStorage>, PossessionLedger<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let ledger = PossessionLedger::new(storage);
        (AccessGate::new(ledger.clone()), ledger)
    }

    #[test]
    fn test_user_without_possession_is_denied() {
        let (gate, _) = gate();
        let user = vellum_core::new_entity_id();
        let content = compute_content_hmac(b"k", b"doc");

        assert!(!gate.can_read(Principal::User(user), &content).unwrap());
        let err = gate.require_read(Principal::User(user), &content).unwrap_err();
        assert!(matches!(
            err,
            VellumError::Access(AccessError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_any_possession_source_grants_equal_rights() {
        let (gate, ledger) = gate();
        let content = compute_content_hmac(b"k", b"doc");

        for source in [
            PossessionSource::OriginUpload,
            PossessionSource::CacheHit,
            PossessionSource::SharedView,
        ] {
            let user = vellum_core::new_entity_id();
            ledger.grant(user, content, source, Utc::now()).unwrap();
            assert!(gate.can_read(Principal::User(user), &content).unwrap());
        }
    }

    #[test]
    fn test_service_principal_bypasses_gate() {
        let (gate, _) = gate();
        let content = compute_content_hmac(b"k", b"doc");
        assert!(gate.can_read(Principal::Service, &content).unwrap());
        assert!(gate.require_read(Principal::Service, &content).is_ok());
    }

    #[test]
    fn test_denial_is_identical_for_absent_and_foreign_content() {
        let (gate, ledger) = gate();
        let owner = vellum_core::new_entity_id();
        let outsider = vellum_core::new_entity_id();
        let existing = compute_content_hmac(b"k", b"someone elses contract");
        let absent = compute_content_hmac(b"k", b"never uploaded");
        ledger
            .grant(owner, existing, PossessionSource::OriginUpload, Utc::now())
            .unwrap();

        let err_existing = gate
            .require_read(Principal::User(outsider), &existing)
            .unwrap_err();
        let err_absent = gate
            .require_read(Principal::User(outsider), &absent)
            .unwrap_err();

        // Both denials look exactly the same.
        assert_eq!(format!("{}", err_existing), format!("{}", err_absent));
    }
}
