//! VELLUM Core - Entity Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types, the state-machine transition tables,
//! and validation - no storage or orchestration logic.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod state;

pub use config::VellumConfig;
pub use entities::{
    AnalysisKey, AnalysisRecord, ArtifactKey, ArtifactRef, Checkpoint, ContentArtifact,
    PossessionRecord, RecoveryQueueEntry, StateTransition, TaskRegistryEntry, UserRequest,
};
pub use enums::{
    AnalysisStatus, ArtifactKind, EntityKind, PossessionSource, RecoveryMethod, RecoveryStatus,
    TaskState,
};
pub use error::{
    AccessError, CheckpointError, ConfigError, RecoveryError, StorageError, TransitionError,
    VellumError, VellumResult,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// User identifier. Opaque to this subsystem; minted by the auth collaborator.
pub type UserId = Uuid;

/// Task identifier. An opaque, caller-supplied unique token.
pub type TaskId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A 32-byte digest. Used both for HMAC-SHA-256 content addresses and for
/// SHA-256 payload/integrity digests.
pub type ContentHash = [u8; 32];

/// Raw binary content for payload storage.
pub type RawContent = Vec<u8>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute the SHA-256 digest of a payload.
///
/// Used for artifact payload integrity and checkpoint integrity hashes.
pub fn compute_content_digest(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute the keyed HMAC-SHA-256 content address of normalized input bytes.
///
/// The key is deployment-wide; keying the address prevents offline
/// dictionary probing of the shared cache by content guessing.
pub fn compute_content_hmac(key: &[u8], content: &[u8]) -> ContentHash {
    type HmacSha256 = Hmac<Sha256>;
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(content);
    let result = mac.finalize().into_bytes();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex encoding of a digest for logs and storage keys.
pub fn hash_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Fingerprint of extraction parameters.
///
/// serde_json serializes object keys in sorted order, so the fingerprint is
/// deterministic for structurally equal parameter sets.
pub fn compute_params_fingerprint(params: &serde_json::Value) -> String {
    let encoded = params.to_string();
    hex::encode(compute_content_digest(encoded.as_bytes()))
}

// ============================================================================
// TESTS
// ============================================================================
