//! Possession ledger: per-user entitlement to read shared content.

use std::sync::Arc;

use vellum_core::{
    ContentHash, PossessionRecord, PossessionSource, StorageError, Timestamp, UserId, VellumError,
    VellumResult,
};
use vellum_storage::StorageTrait;

/// Ledger of possession records.
///
/// `source` distinguishes origin uploads from cache hits from shared views
/// for audit and analytics only; all sources grant equal read rights.
pub struct PossessionLedger<S: StorageTrait> {
    storage: Arc<S>,
}

impl<S: StorageTrait> Clone for PossessionLedger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageTrait> PossessionLedger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Grant possession of a content hash to a user.
    ///
    /// Idempotent per `(user, content_hash)`: re-granting returns the
    /// existing record unchanged, preserving its original source.
    pub fn grant(
        &self,
        user_id: UserId,
        content_hash: ContentHash,
        source: PossessionSource,
        now: Timestamp,
    ) -> VellumResult<PossessionRecord> {
        if let Some(existing) = self.storage.possession_get(user_id, &content_hash)? {
            return Ok(existing);
        }
        let record = PossessionRecord::new(user_id, content_hash, source, now);
        match self.storage.possession_insert(&record) {
            Ok(()) => Ok(record),
            // Raced with a concurrent grant for the same pair; adopt it.
            Err(VellumError::Storage(StorageError::DuplicateKey { .. })) => self
                .storage
                .possession_get(user_id, &content_hash)?
                .ok_or_else(|| {
                    VellumError::Storage(StorageError::NotFound {
                        kind: vellum_core::EntityKind::Possession,
                        key: format!("{}/{}", user_id, hex::encode(content_hash)),
                    })
                }),
            Err(other) => Err(other),
        }
    }

    /// Whether the user holds possession of the hash.
    pub fn has_possession(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
    ) -> VellumResult<bool> {
        Ok(self.storage.possession_get(user_id, content_hash)?.is_some())
    }

    /// Refresh the viewed-at stamp after a successful read.
    pub fn touch_viewed(
        &self,
        user_id: UserId,
        content_hash: &ContentHash,
        now: Timestamp,
    ) -> VellumResult<()> {
        self.storage.possession_touch_viewed(user_id, content_hash, now)
    }

    /// One user's possessions, for their own library view.
    pub fn list_for_user(&self, user_id: UserId) -> VellumResult<Vec<PossessionRecord>> {
        self.storage.possession_list_for_user(user_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
