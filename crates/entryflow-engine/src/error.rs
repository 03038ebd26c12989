//! Engine error types.
//!
//! Everything returned as [`EngineError`] is node-fatal: it aborts the
//! current invocation and is surfaced to the scheduler. Entry-level failures
//! never become an `EngineError`; they are recorded on the entry instead.

use entryflow_core::{CoreError, NodeType};
use entryflow_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A data-model invariant was violated (wrong node type, cycle, ...).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// No processor is registered for the node's type.
    #[error("no processor registered for node type {0}")]
    NoProcessor(NodeType),

    /// The processor does not implement the requested lifecycle hook.
    #[error("{node_type} processor does not support {operation}")]
    Unsupported {
        node_type: NodeType,
        operation: &'static str,
    },

    /// Enqueueing a node invocation failed.
    #[error("queue error: {0}")]
    Queue(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A spawned entry worker panicked or was cancelled.
    #[error("entry worker failed: {0}")]
    Worker(String),
}
