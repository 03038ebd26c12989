//! Dataset processor: source records pass through unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use entryflow_core::node::labels;
use entryflow_core::{CacheMatchField, CacheWriteField, Node, NodeEntry, NodeType};

use super::{EntryOutcome, NodeProcessor};
use crate::config::PipelineConfig;
use crate::error::EngineError;

pub struct DatasetProcessor {
    config: Arc<PipelineConfig>,
}

impl DatasetProcessor {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        DatasetProcessor { config }
    }
}

#[async_trait]
impl NodeProcessor for DatasetProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Dataset
    }

    fn cache_match_fields(&self, _node: &Node) -> &'static [CacheMatchField] {
        &[CacheMatchField::IncomingInputHash, CacheMatchField::IncomingOutputHash]
    }

    fn cache_write_fields(&self) -> &'static [CacheWriteField] {
        &[CacheWriteField::OutgoingInputHash, CacheWriteField::OutgoingOutputHash]
    }

    fn concurrency(&self, node: &Node) -> Result<usize, EngineError> {
        node.as_dataset()?;
        Ok(self.config.clamp_concurrency(None))
    }

    async fn process_entry(&self, node: &Node, entry: &NodeEntry) -> Result<EntryOutcome, EngineError> {
        node.as_dataset()?;
        Ok(EntryOutcome::Processed {
            output: entry.payload.output.clone(),
            explanation: None,
        })
    }

    fn output_label(&self, _entry: &NodeEntry) -> Option<&'static str> {
        Some(labels::ENTRIES)
    }
}
