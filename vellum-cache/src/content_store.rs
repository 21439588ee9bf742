//! Append-only, content-addressed storage of derived artifacts.

use std::sync::Arc;

use vellum_core::{
    ArtifactKey, ArtifactRef, ContentArtifact, ContentHash, StorageError, Timestamp, VellumError,
    VellumResult,
};
use vellum_storage::StorageTrait;

/// Content store service.
///
/// Keys incorporate the algorithm version and parameter fingerprint, so a
/// changed extraction algorithm never collides with stale artifacts. Old
/// versions stay retrievable until `prune_versions_before`.
pub struct ContentStore<S: StorageTrait> {
    storage: Arc<S>,
}

impl<S: StorageTrait> Clone for ContentStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageTrait> ContentStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Store a derived artifact. Idempotent: a second `put` with the same
    /// key and equal payload returns the existing reference. A `put` with
    /// the same key and a *different* payload is a programmer error
    /// (content addressing assumes determinism per algorithm version) and
    /// fails with `DigestCollision` rather than silently overwriting.
    pub fn put(
        &self,
        key: ArtifactKey,
        payload: &[u8],
        now: Timestamp,
    ) -> VellumResult<ArtifactRef> {
        let candidate = ContentArtifact::from_payload(key.clone(), payload.to_vec(), now);

        if let Some(existing) = self.storage.artifact_get(&key)? {
            return self.reconcile(existing, &candidate);
        }

        match self.storage.artifact_insert(&candidate) {
            Ok(()) => Ok(candidate.to_ref()),
            // Raced with another writer; adopt whatever landed if it matches.
            Err(VellumError::Storage(StorageError::DuplicateKey { .. })) => {
                let existing = self.storage.artifact_get(&key)?.ok_or_else(|| {
                    VellumError::Storage(StorageError::NotFound {
                        kind: vellum_core::EntityKind::Artifact,
                        key: key.display_key(),
                    })
                })?;
                self.reconcile(existing, &candidate)
            }
            Err(other) => Err(other),
        }
    }

    fn reconcile(
        &self,
        existing: ContentArtifact,
        candidate: &ContentArtifact,
    ) -> VellumResult<ArtifactRef> {
        if existing.payload_digest == candidate.payload_digest {
            return Ok(existing.to_ref());
        }
        tracing::error!(
            key = %existing.key.display_key(),
            stored = %hex::encode(existing.payload_digest),
            offered = %hex::encode(candidate.payload_digest),
            "Non-deterministic artifact payload for identical key"
        );
        Err(VellumError::Storage(StorageError::DigestCollision {
            key: existing.key.display_key(),
            stored: hex::encode(existing.payload_digest),
            offered: hex::encode(candidate.payload_digest),
        }))
    }

    /// Fetch an artifact. Absence means "needs computation", not an error.
    pub fn get(&self, key: &ArtifactKey) -> VellumResult<Option<ContentArtifact>> {
        self.storage.artifact_get(key)
    }

    /// All artifacts derived from one content address, any kind or version.
    pub fn list_for_content(
        &self,
        content_hmac: &ContentHash,
    ) -> VellumResult<Vec<ContentArtifact>> {
        self.storage.artifact_list_by_content(content_hmac)
    }

    /// Explicit retention policy: drop artifacts from algorithm versions
    /// older than `min_algorithm_version`. Returns the number removed.
    pub fn prune_versions_before(&self, min_algorithm_version: i32) -> VellumResult<usize> {
        let removed = self
            .storage
            .artifact_prune_versions_before(min_algorithm_version)?;
        if removed > 0 {
            tracing::info!(
                removed,
                min_algorithm_version,
                "Pruned superseded artifact versions"
            );
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vellum_core::{compute_content_hmac, ArtifactKind};
    use vellum_storage::MemoryStorage;

    fn store() -> ContentStore<MemoryStorage> {
        ContentStore::new(Arc::new(MemoryStorage::new()))
    }

    fn key(version: i32) -> ArtifactKey {
        ArtifactKey::document(
            compute_content_hmac(b"k", b"contract"),
            version,
            "fp-default",
            ArtifactKind::FullText,
        )
    }

    #[test]
    fn test_put_twice_same_payload_is_idempotent() {
        let store = store();
        let first = store.put(key(1), b"extracted text", Utc::now()).unwrap();
        let second = store.put(key(1), b"extracted text", Utc::now()).unwrap();
        assert_eq!(first.artifact_id, second.artifact_id);
        assert_eq!(first.payload_digest, second.payload_digest);
    }

    #[test]
    fn test_put_same_key_different_payload_fails_loudly() {
        let store = store();
        store.put(key(1), b"extracted text", Utc::now()).unwrap();
        let err = store.put(key(1), b"DIFFERENT text", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            VellumError::Storage(StorageError::DigestCollision { .. })
        ));
        // The stored payload is untouched.
        let stored = store.get(&key(1)).unwrap().unwrap();
        assert_eq!(stored.payload, b"extracted text".to_vec());
    }

    #[test]
    fn test_get_absent_returns_none() {
        let store = store();
        assert!(store.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn test_versions_do_not_collide() {
        let store = store();
        store.put(key(1), b"old algorithm output", Utc::now()).unwrap();
        store.put(key(2), b"new algorithm output", Utc::now()).unwrap();

        assert_eq!(
            store.get(&key(1)).unwrap().unwrap().payload,
            b"old algorithm output".to_vec()
        );
        assert_eq!(
            store.get(&key(2)).unwrap().unwrap().payload,
            b"new algorithm output".to_vec()
        );
    }

    #[test]
    fn test_old_versions_survive_until_pruned() {
        let store = store();
        store.put(key(1), b"v1 output", Utc::now()).unwrap();
        store.put(key(2), b"v2 output", Utc::now()).unwrap();

        let removed = store.prune_versions_before(2).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&key(1)).unwrap().is_none());
        assert!(store.get(&key(2)).unwrap().is_some());
    }

    #[test]
    fn test_list_for_content_spans_kinds() {
        let store = store();
        let hmac = compute_content_hmac(b"k", b"contract");
        store
            .put(
                ArtifactKey::document(hmac, 1, "fp", ArtifactKind::FullText),
                b"text",
                Utc::now(),
            )
            .unwrap();
        store
            .put(
                ArtifactKey::page(hmac, 1, "fp", ArtifactKind::PageText, 1),
                b"page one",
                Utc::now(),
            )
            .unwrap();

        assert_eq!(store.list_for_content(&hmac).unwrap().len(), 2);
    }
}
