//! Per-node-type processing strategies.
//!
//! A [`NodeProcessor`] declares how entries of its node type are cached
//! (match and write fields), how many are pulled and processed at once, and
//! implements either a bulk [`before_all`](NodeProcessor::before_all) step or
//! per-entry [`process_entry`](NodeProcessor::process_entry). The
//! [`ProcessorRegistry`] dispatches on [`NodeType`].

pub mod dataset;
pub mod filter;
pub mod llm_relabel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use entryflow_core::{CacheMatchField, CacheWriteField, Node, NodeConfig, NodeEntry, NodeType};
use entryflow_storage::{FilterRunStats, PipelineStore};

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::llm::CompletionClient;
use crate::rate_limit::RateLimiter;

pub use dataset::DatasetProcessor;
pub use filter::FilterProcessor;
pub use llm_relabel::LlmRelabelProcessor;

/// What happened to one entry in `process_entry`.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// The entry's new output (or `None` for no output) and an optional
    /// explanation to keep in the cache.
    Processed {
        output: Option<Value>,
        explanation: Option<String>,
    },
    /// Transient failure; the entry goes back to PENDING for a later run.
    Deferred { reason: String },
    /// Entry-fatal failure; the entry is marked ERROR.
    Failed { message: String },
}

/// Result of a bulk `before_all` step that handled the whole node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub processed: usize,
    pub cache_hits: usize,
    pub cache_writes: usize,
}

impl From<FilterRunStats> for BulkOutcome {
    fn from(stats: FilterRunStats) -> Self {
        BulkOutcome {
            processed: stats.classified,
            cache_hits: stats.cache_hits,
            cache_writes: stats.cache_writes,
        }
    }
}

#[async_trait]
pub trait NodeProcessor: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Named outputs produced by nodes of this type.
    fn outputs(&self) -> &'static [&'static str] {
        self.node_type().output_labels()
    }

    /// Hash fields that must match for a cache hit at `node`.
    fn cache_match_fields(&self, node: &Node) -> &'static [CacheMatchField];

    /// Result fields persisted on a cache write.
    fn cache_write_fields(&self) -> &'static [CacheWriteField];

    /// Entries pulled per execution round.
    fn read_batch_size(&self) -> usize {
        100
    }

    /// Maximum entries processed in parallel for one invocation of `node`.
    fn concurrency(&self, _node: &Node) -> Result<usize, EngineError> {
        Ok(1)
    }

    /// Whether cached results computed under `old` stay valid under `new`,
    /// so they can be copied to the new node hash instead of recomputed.
    fn subsumes(&self, _old: &NodeConfig, _new: &NodeConfig) -> bool {
        false
    }

    /// Bulk whole-node step run once per invocation. `Some` means every
    /// entry was handled and per-entry processing is skipped.
    fn before_all(
        &self,
        _node: &Node,
        _store: &mut dyn PipelineStore,
    ) -> Result<Option<BulkOutcome>, EngineError> {
        Ok(None)
    }

    /// Per-entry transformation.
    ///
    /// Returns `Err` only for node-fatal problems; entry problems are
    /// reported through [`EntryOutcome`].
    async fn process_entry(&self, _node: &Node, _entry: &NodeEntry) -> Result<EntryOutcome, EngineError> {
        Err(EngineError::Unsupported {
            node_type: self.node_type(),
            operation: "process_entry",
        })
    }

    /// Output a processed entry is forwarded through, if any. Must be one of
    /// [`outputs`](NodeProcessor::outputs).
    fn output_label(&self, entry: &NodeEntry) -> Option<&'static str>;
}

/// Processors by node type.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<NodeType, Arc<dyn NodeProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in Dataset, Filter and LLMRelabel processors.
    pub fn standard(
        config: Arc<PipelineConfig>,
        client: Arc<dyn CompletionClient>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(DatasetProcessor::new(config.clone())));
        registry.register(Arc::new(FilterProcessor));
        registry.register(Arc::new(LlmRelabelProcessor::new(config, client, limiter)));
        registry
    }

    /// Registers a processor, replacing any previous one for its type.
    pub fn register(&mut self, processor: Arc<dyn NodeProcessor>) {
        self.processors.insert(processor.node_type(), processor);
    }

    pub fn get(&self, node_type: NodeType) -> Result<Arc<dyn NodeProcessor>, EngineError> {
        self.processors
            .get(&node_type)
            .cloned()
            .ok_or(EngineError::NoProcessor(node_type))
    }
}
