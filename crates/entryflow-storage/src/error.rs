//! Storage error types for entryflow-storage.
//!
//! [`StorageError`] covers the failure modes of the storage layer: SQLite and
//! migration failures, JSON (de)serialization of payload and config columns,
//! missing records, and violated model invariants surfaced by the core crate.

use entryflow_core::{CoreError, NodeEntryId, NodeId, NodeOutputId};
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A data-model invariant was violated (illegal transition, cycle, ...).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A node with the given ID was not found.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node output with the given ID was not found.
    #[error("node output not found: {0}")]
    OutputNotFound(NodeOutputId),

    /// A node entry with the given ID was not found.
    #[error("node entry not found: {0}")]
    EntryNotFound(NodeEntryId),

    /// A data integrity violation was detected.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },
}
