//! Content-addressed cache key and row types.
//!
//! A cache row maps `(node_hash, incoming_input_hash, incoming_output_hash)`
//! to the result of running an entry with that content through a node with
//! that configuration. Rows are append-only.

use serde::{Deserialize, Serialize};

use crate::filter::FilterOutcome;
use crate::id::{ContentHash, NodeId};

/// Full key of a cache row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub node_hash: ContentHash,
    pub incoming_input_hash: ContentHash,
    pub incoming_output_hash: ContentHash,
}

/// Key components a processor matches on when looking up the cache.
///
/// The node hash is always matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMatchField {
    IncomingInputHash,
    IncomingOutputHash,
}

/// Result fields a processor persists when writing the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheWriteField {
    OutgoingInputHash,
    OutgoingOutputHash,
    FilterOutcome,
    Explanation,
}

/// The result half of a cache row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheWrite {
    pub outgoing_input_hash: Option<ContentHash>,
    pub outgoing_output_hash: Option<ContentHash>,
    pub filter_outcome: Option<FilterOutcome>,
    pub explanation: Option<String>,
}

impl CacheWrite {
    /// Drops every field the processor did not declare as a write field.
    pub fn restricted_to(self, fields: &[CacheWriteField]) -> CacheWrite {
        let keep = |field: CacheWriteField| fields.contains(&field);
        CacheWrite {
            outgoing_input_hash: self
                .outgoing_input_hash
                .filter(|_| keep(CacheWriteField::OutgoingInputHash)),
            outgoing_output_hash: self
                .outgoing_output_hash
                .filter(|_| keep(CacheWriteField::OutgoingOutputHash)),
            filter_outcome: self
                .filter_outcome
                .filter(|_| keep(CacheWriteField::FilterOutcome)),
            explanation: self.explanation.filter(|_| keep(CacheWriteField::Explanation)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing_input_hash.is_none()
            && self.outgoing_output_hash.is_none()
            && self.filter_outcome.is_none()
            && self.explanation.is_none()
    }
}

/// A persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProcessedEntry {
    /// Node that wrote the row; `None` once that node has been deleted.
    pub node_id: Option<NodeId>,
    pub key: CacheKey,
    pub result: CacheWrite,
    pub created_at: String,
    pub updated_at: String,
}
