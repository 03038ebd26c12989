//! Filter processor: bulk Passed/Failed classification in SQL.

use async_trait::async_trait;
use tracing::info;

use entryflow_core::{CacheMatchField, CacheWriteField, Node, NodeEntry, NodeType};
use entryflow_storage::PipelineStore;

use super::{BulkOutcome, NodeProcessor};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterProcessor;

#[async_trait]
impl NodeProcessor for FilterProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Filter
    }

    fn cache_match_fields(&self, _node: &Node) -> &'static [CacheMatchField] {
        &[CacheMatchField::IncomingInputHash, CacheMatchField::IncomingOutputHash]
    }

    fn cache_write_fields(&self) -> &'static [CacheWriteField] {
        &[CacheWriteField::FilterOutcome]
    }

    /// Claims every PENDING entry, then classifies all PROCESSING entries
    /// (including ones left over from an interrupted run) in one transaction.
    fn before_all(
        &self,
        node: &Node,
        store: &mut dyn PipelineStore,
    ) -> Result<Option<BulkOutcome>, EngineError> {
        node.as_filter()?;
        let claimed = store.mark_all_processing(node.id)?;
        let stats = store.classify_filter(node)?;
        info!(
            node = %node.id,
            claimed,
            classified = stats.classified,
            passed = stats.passed,
            failed = stats.failed,
            cache_hits = stats.cache_hits,
            cache_writes = stats.cache_writes,
            "filter classification complete"
        );
        Ok(Some(stats.into()))
    }

    fn output_label(&self, entry: &NodeEntry) -> Option<&'static str> {
        entry.filter_outcome.map(|outcome| outcome.output_label())
    }
}
