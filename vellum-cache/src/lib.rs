//! VELLUM Cache - Shared Content Domain
//!
//! The services over the content-addressed half of the system:
//!
//! - `ContentStore`: append-only derived artifacts, idempotent by digest
//! - `AnalysisCache`: the single authoritative analysis per content key,
//!   with conflict-upsert and the at-most-one-in-flight invariant
//! - `PossessionLedger`: per-user entitlement records
//! - `AccessGate`: the one predicate every shared read goes through
//!
//! Two strangers who upload byte-identical contracts both see the one
//! computed analysis; neither learns who else uploaded it. The ledger is the
//! only bridge between private ownership and the shared cache, and reads
//! never join possession rows across users.

mod analysis;
mod content_store;
mod gate;
mod possession;

pub use analysis::{AnalysisCache, UpsertOutcome};
pub use content_store::ContentStore;
pub use gate::{AccessGate, Principal};
pub use possession::PossessionLedger;
