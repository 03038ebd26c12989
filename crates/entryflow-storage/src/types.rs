//! Inputs and reports exchanged with the store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use entryflow_core::{ContentHash, EntryPayload, EntryStatus, Node, NodeEntryId, NodeId};

/// An entry to create at a destination node from a processed parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEntry {
    pub destination: NodeId,
    pub parent: NodeEntryId,
    pub payload: EntryPayload,
}

/// Counts produced by one bulk filter classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterRunStats {
    /// Entries moved from PROCESSING to PROCESSED.
    pub classified: usize,
    /// Cache rows newly written by this run.
    pub cache_writes: usize,
    /// Entries whose outcome came from an existing cache row.
    pub cache_hits: usize,
    pub passed: usize,
    pub failed: usize,
}

/// What one invalidation transaction changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvalidationReport {
    /// Entries at the invalidated node reset to PENDING.
    pub reset: usize,
    /// Downstream entries deleted because their parent chain led here.
    pub deleted_descendants: usize,
}

/// Result of replacing a node's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub node: Node,
    pub previous_hash: ContentHash,
    /// Cache rows copied from the previous hash.
    pub carried: usize,
    /// Set when the hash changed and the node was invalidated.
    pub invalidation: Option<InvalidationReport>,
}

impl ConfigChange {
    pub fn hash_changed(&self) -> bool {
        self.node.hash != self.previous_hash
    }
}

/// Per-status entry counts for one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts(pub HashMap<EntryStatus, usize>);

impl StatusCounts {
    pub fn get(&self, status: EntryStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}
