//! Core error types for entryflow-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! invariants owned by the data model itself.

use thiserror::Error;

use crate::id::NodeId;
use crate::node::NodeType;
use crate::status::EntryStatus;

/// Core errors produced by the entryflow-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status change that the entry state machine does not allow.
    #[error("illegal entry status transition: {from} -> {to}")]
    IllegalTransition { from: EntryStatus, to: EntryStatus },

    /// A persisted status string that does not name a known status.
    #[error("unknown entry status: '{value}'")]
    UnknownStatus { value: String },

    /// A persisted node type string that does not name a known node type.
    #[error("unknown node type: '{value}'")]
    UnknownNodeType { value: String },

    /// A persisted filter outcome string that is neither Passed nor Failed.
    #[error("unknown filter outcome: '{value}'")]
    UnknownOutcome { value: String },

    /// Adding the channel would close a cycle in the node graph.
    #[error("channel {origin} -> {destination} would create a cycle")]
    CycleDetected { origin: NodeId, destination: NodeId },

    /// A node id was not part of the graph.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// A filter predicate failed validation.
    #[error("invalid filter: {reason}")]
    InvalidFilter { reason: String },

    /// A node configuration failed validation.
    #[error("invalid node config: {reason}")]
    InvalidConfig { reason: String },

    /// A node's configuration belongs to a different node type than expected.
    #[error("node {node} has type {actual}, expected {expected}")]
    NodeTypeMismatch {
        node: NodeId,
        expected: NodeType,
        actual: NodeType,
    },
}
