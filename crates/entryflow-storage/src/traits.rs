//! The [`PipelineStore`] trait defining the storage contract of the pipeline.
//!
//! Methods fall into four groups:
//! - **Graph**: nodes, outputs and channels (the DAG's persisted records).
//! - **Entries**: per-node entry state and its status transitions.
//! - **Cache**: the append-only content-addressed result cache.
//! - **Bulk**: multi-statement operations that must run in one transaction
//!   (invalidation, filter classification).
//!
//! The trait is synchronous. Async callers hold the store behind a
//! `tokio::sync::Mutex` and keep I/O-bound work (LLM calls) outside the lock.

use std::time::Duration;

use serde_json::Value;

use entryflow_core::{
    CacheKey, CacheMatchField, CacheWrite, CachedProcessedEntry, ContentHash, DataChannel,
    EntryPayload, Node, NodeConfig, NodeEntry, NodeEntryId, NodeGraph, NodeId, NodeOutput,
    NodeOutputId, ProjectId,
};

use crate::error::StorageError;
use crate::types::{ChildEntry, ConfigChange, FilterRunStats, InvalidationReport, StatusCounts};

/// The storage contract for pipeline state.
pub trait PipelineStore: Send {
    // -------------------------------------------------------------------
    // Graph
    // -------------------------------------------------------------------

    /// Creates a node, computing its hash and creating the outputs its type
    /// produces.
    fn create_node(
        &mut self,
        project: ProjectId,
        name: &str,
        config: &NodeConfig,
    ) -> Result<Node, StorageError>;

    /// Retrieves a node by ID.
    fn get_node(&self, id: NodeId) -> Result<Node, StorageError>;

    /// Replaces a node's configuration and hash. The node type cannot change.
    ///
    /// When the hash changes, the node is invalidated as by
    /// [`invalidate_descendants`](PipelineStore::invalidate_descendants), after
    /// copying its cache rows to the new hash if `carry_cache` is set. All of
    /// it commits or none of it does.
    fn replace_config(
        &mut self,
        id: NodeId,
        config: &NodeConfig,
        carry_cache: bool,
    ) -> Result<ConfigChange, StorageError>;

    /// Deletes a node with its outputs, channels and entries. Cache rows it
    /// wrote are kept.
    fn delete_node(&mut self, id: NodeId) -> Result<(), StorageError>;

    /// Lists the outputs of a node in creation order.
    fn list_outputs(&self, node: NodeId) -> Result<Vec<NodeOutput>, StorageError>;

    /// Finds a node's output by label.
    fn output_by_label(&self, node: NodeId, label: &str) -> Result<NodeOutput, StorageError>;

    /// Connects an output to a destination node, rejecting cycles.
    fn connect(
        &mut self,
        origin: NodeOutputId,
        destination: NodeId,
    ) -> Result<DataChannel, StorageError>;

    /// Loads all nodes, outputs and channels of a project as a [`NodeGraph`].
    fn load_graph(&self, project: ProjectId) -> Result<NodeGraph, StorageError>;

    // -------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------

    /// Inserts root entries (no parent) at a node, status PENDING.
    fn insert_entries(
        &mut self,
        node: NodeId,
        payloads: &[EntryPayload],
    ) -> Result<Vec<NodeEntryId>, StorageError>;

    /// Inserts forwarded entries, skipping any (destination, parent) pair
    /// that already exists. Returns the number inserted.
    fn insert_child_entries(&mut self, children: &[ChildEntry]) -> Result<usize, StorageError>;

    fn get_entry(&self, id: NodeEntryId) -> Result<NodeEntry, StorageError>;

    /// All entries at a node in creation order.
    fn list_entries(&self, node: NodeId) -> Result<Vec<NodeEntry>, StorageError>;

    /// Up to `batch_size` PENDING entries at a node, oldest first.
    fn list_pending(&self, node: NodeId, batch_size: usize) -> Result<Vec<NodeEntry>, StorageError>;

    /// All PROCESSED entries at a node, oldest first.
    fn list_processed(&self, node: NodeId) -> Result<Vec<NodeEntry>, StorageError>;

    /// Claims entries PENDING -> PROCESSING. Entries no longer PENDING are
    /// skipped; the claimed entries are returned.
    fn claim_entries(&mut self, ids: &[NodeEntryId]) -> Result<Vec<NodeEntry>, StorageError>;

    /// PROCESSING -> PROCESSED, recording the result fields on the entry.
    fn record_processed(&mut self, id: NodeEntryId, result: &CacheWrite) -> Result<(), StorageError>;

    /// PROCESSING -> PENDING with a transient diagnostic (retry later).
    fn record_deferred(&mut self, id: NodeEntryId, diagnostic: &str) -> Result<(), StorageError>;

    /// PROCESSING -> ERROR with a terminal error message.
    fn record_failed(&mut self, id: NodeEntryId, error: &str) -> Result<(), StorageError>;

    fn status_counts(&self, node: NodeId) -> Result<StatusCounts, StorageError>;

    /// Resets PROCESSING entries claimed longer than `older_than` ago back to
    /// PENDING. Limited to one node when `node` is given.
    fn recover_stale(&mut self, node: Option<NodeId>, older_than: Duration) -> Result<usize, StorageError>;

    // -------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------

    /// Looks up a cache row by node hash and the selected incoming hashes.
    fn lookup_cache(
        &self,
        node_hash: &ContentHash,
        incoming_input_hash: &ContentHash,
        incoming_output_hash: &ContentHash,
        match_fields: &[CacheMatchField],
    ) -> Result<Option<CachedProcessedEntry>, StorageError>;

    /// Inserts a cache row unless one exists for the key. Returns whether a
    /// row was written.
    fn write_cache(
        &mut self,
        node: NodeId,
        key: &CacheKey,
        result: &CacheWrite,
    ) -> Result<bool, StorageError>;

    /// Copies every row of `old_hash` to `new_hash`, attributed to `node`.
    /// Existing rows under `new_hash` win. Returns the number copied.
    fn convert_cache(
        &mut self,
        old_hash: &ContentHash,
        new_hash: &ContentHash,
        node: NodeId,
    ) -> Result<usize, StorageError>;

    /// Number of cache rows stored under a node hash.
    fn count_cache_rows(&self, node_hash: &ContentHash) -> Result<usize, StorageError>;

    /// Stores an output payload under its content hash (no-op if present).
    fn put_output(&mut self, hash: &ContentHash, output: &Value) -> Result<(), StorageError>;

    fn get_output(&self, hash: &ContentHash) -> Result<Option<Value>, StorageError>;

    // -------------------------------------------------------------------
    // Bulk
    // -------------------------------------------------------------------

    /// Deletes all entries descended from entries at `node` and resets the
    /// node's own entries to PENDING, in one transaction.
    fn invalidate_descendants(&mut self, node: NodeId) -> Result<InvalidationReport, StorageError>;

    /// Claims every PENDING entry at a node (PENDING -> PROCESSING).
    fn mark_all_processing(&mut self, node: NodeId) -> Result<usize, StorageError>;

    /// Classifies every PROCESSING entry at a filter node in one transaction:
    /// writes missing cache rows from a single predicate query, copies the
    /// outcomes onto the entries and marks them PROCESSED.
    fn classify_filter(&mut self, node: &Node) -> Result<FilterRunStats, StorageError>;
}
