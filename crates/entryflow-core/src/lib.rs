//! Core data model for the entryflow pipeline.
//!
//! Defines the persisted record types (nodes, outputs, channels, entries,
//! cache rows), the entry status state machine, filter predicates, and the
//! [`graph::NodeGraph`] view used for descendant traversal.

pub mod cache;
pub mod entry;
pub mod error;
pub mod filter;
pub mod graph;
pub mod id;
pub mod node;
pub mod status;

// Re-export commonly used types
pub use cache::{CacheKey, CacheMatchField, CacheWrite, CacheWriteField, CachedProcessedEntry};
pub use entry::{EntryPayload, NodeEntry};
pub use error::CoreError;
pub use filter::{FilterComparator, FilterOutcome, FilterPredicate};
pub use graph::{NodeGraph, Traversal};
pub use id::{ContentHash, DataChannelId, NodeEntryId, NodeId, NodeOutputId, ProjectId};
pub use node::{
    DataChannel, DatasetConfig, FilterConfig, LlmRelabelConfig, Node, NodeConfig, NodeOutput,
    NodeType,
};
pub use status::{EntryStatus, TransitionCause};
