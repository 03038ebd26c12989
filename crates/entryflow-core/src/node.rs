//! Nodes, their output ports, and the channels that connect them.
//!
//! A node's behavior is fully described by its [`NodeConfig`], a tagged
//! variant per node type. The node `hash` is derived from
//! [`NodeConfig::hash_projection`], so fields that do not influence results
//! (such as a concurrency cap) can change without invalidating any cache row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::CoreError;
use crate::filter::FilterPredicate;
use crate::id::{ContentHash, DataChannelId, NodeId, NodeOutputId, ProjectId};

/// Output port labels.
pub mod labels {
    pub const ENTRIES: &str = "Entries";
    pub const PASSED: &str = "Passed";
    pub const FAILED: &str = "Failed";
    pub const RELABELED: &str = "Relabeled";
}

/// Enumerated node kinds. Dispatch to a processor happens on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Dataset,
    Filter,
    #[serde(rename = "LLMRelabel")]
    LlmRelabel,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Dataset => "Dataset",
            NodeType::Filter => "Filter",
            NodeType::LlmRelabel => "LLMRelabel",
        }
    }

    /// The named outputs a node of this type produces, in creation order.
    pub fn output_labels(self) -> &'static [&'static str] {
        match self {
            NodeType::Dataset => &[labels::ENTRIES],
            NodeType::Filter => &[labels::PASSED, labels::FAILED],
            NodeType::LlmRelabel => &[labels::RELABELED],
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dataset" => Ok(NodeType::Dataset),
            "Filter" => Ok(NodeType::Filter),
            "LLMRelabel" => Ok(NodeType::LlmRelabel),
            other => Err(CoreError::UnknownNodeType {
                value: other.to_string(),
            }),
        }
    }
}

/// Source node holding imported dataset records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_id: i64,
}

/// Bulk classification into Passed/Failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
}

/// Per-entry relabeling through an LLM completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmRelabelConfig {
    pub model: String,
    /// Pass the existing output through unchanged instead of calling the model.
    #[serde(default)]
    pub skip_relabel: bool,
    /// User cap on parallel completion calls for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Type-specific node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeConfig {
    Dataset(DatasetConfig),
    Filter(FilterConfig),
    #[serde(rename = "LLMRelabel")]
    LlmRelabel(LlmRelabelConfig),
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Dataset(_) => NodeType::Dataset,
            NodeConfig::Filter(_) => NodeType::Filter,
            NodeConfig::LlmRelabel(_) => NodeType::LlmRelabel,
        }
    }

    /// The part of the configuration that determines processing results.
    ///
    /// Hashing this value (together with the node type) yields the node hash.
    pub fn hash_projection(&self) -> serde_json::Value {
        match self {
            NodeConfig::Dataset(cfg) => json!({ "dataset_id": cfg.dataset_id }),
            NodeConfig::Filter(cfg) => json!({ "filters": cfg.filters }),
            NodeConfig::LlmRelabel(cfg) => json!({
                "model": cfg.model,
                "skip_relabel": cfg.skip_relabel,
            }),
        }
    }

    /// Validates type-specific invariants (filter field paths, non-empty model).
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            NodeConfig::Dataset(_) => Ok(()),
            NodeConfig::Filter(cfg) => cfg.filters.iter().try_for_each(|f| f.validate()),
            NodeConfig::LlmRelabel(cfg) => {
                if cfg.model.trim().is_empty() && !cfg.skip_relabel {
                    return Err(CoreError::InvalidConfig {
                        reason: "relabel node requires a model".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// A named processing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub project_id: ProjectId,
    pub name: String,
    pub hash: ContentHash,
    pub config: NodeConfig,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }

    pub fn as_filter(&self) -> Result<&FilterConfig, CoreError> {
        match &self.config {
            NodeConfig::Filter(cfg) => Ok(cfg),
            other => Err(self.mismatch(NodeType::Filter, other)),
        }
    }

    pub fn as_llm_relabel(&self) -> Result<&LlmRelabelConfig, CoreError> {
        match &self.config {
            NodeConfig::LlmRelabel(cfg) => Ok(cfg),
            other => Err(self.mismatch(NodeType::LlmRelabel, other)),
        }
    }

    pub fn as_dataset(&self) -> Result<&DatasetConfig, CoreError> {
        match &self.config {
            NodeConfig::Dataset(cfg) => Ok(cfg),
            other => Err(self.mismatch(NodeType::Dataset, other)),
        }
    }

    fn mismatch(&self, expected: NodeType, actual: &NodeConfig) -> CoreError {
        CoreError::NodeTypeMismatch {
            node: self.id,
            expected,
            actual: actual.node_type(),
        }
    }
}

/// A named output port of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub id: NodeOutputId,
    pub node_id: NodeId,
    pub label: String,
}

/// Directed edge from a node output to a destination node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannel {
    pub id: DataChannelId,
    pub origin_id: NodeOutputId,
    pub destination_id: NodeId,
}
