//! LLMRelabel processor: one completion call per entry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use entryflow_core::node::labels;
use entryflow_core::{CacheMatchField, CacheWriteField, Node, NodeConfig, NodeEntry, NodeType};

use super::{EntryOutcome, NodeProcessor};
use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::llm::{CompletionClient, CompletionError, CompletionRequest};
use crate::rate_limit::RateLimiter;

pub struct LlmRelabelProcessor {
    config: Arc<PipelineConfig>,
    client: Arc<dyn CompletionClient>,
    limiter: Arc<RateLimiter>,
}

impl LlmRelabelProcessor {
    pub fn new(
        config: Arc<PipelineConfig>,
        client: Arc<dyn CompletionClient>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        LlmRelabelProcessor {
            config,
            client,
            limiter,
        }
    }
}

#[async_trait]
impl NodeProcessor for LlmRelabelProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::LlmRelabel
    }

    /// Relabeling ignores the prior output, so only the input keys the
    /// cache. A skipping node passes the output through, so it keys on both.
    fn cache_match_fields(&self, node: &Node) -> &'static [CacheMatchField] {
        match &node.config {
            NodeConfig::LlmRelabel(cfg) if cfg.skip_relabel => &[
                CacheMatchField::IncomingInputHash,
                CacheMatchField::IncomingOutputHash,
            ],
            _ => &[CacheMatchField::IncomingInputHash],
        }
    }

    fn cache_write_fields(&self) -> &'static [CacheWriteField] {
        &[CacheWriteField::OutgoingInputHash, CacheWriteField::OutgoingOutputHash]
    }

    fn read_batch_size(&self) -> usize {
        50
    }

    fn concurrency(&self, node: &Node) -> Result<usize, EngineError> {
        let cfg = node.as_llm_relabel()?;
        Ok(self.config.clamp_concurrency(cfg.max_concurrency))
    }

    /// With relabeling skipped on both sides the model does not affect the
    /// result, so earlier results carry over.
    fn subsumes(&self, old: &NodeConfig, new: &NodeConfig) -> bool {
        matches!(
            (old, new),
            (NodeConfig::LlmRelabel(old), NodeConfig::LlmRelabel(new))
                if old.skip_relabel && new.skip_relabel
        )
    }

    async fn process_entry(&self, node: &Node, entry: &NodeEntry) -> Result<EntryOutcome, EngineError> {
        let cfg = node.as_llm_relabel()?;

        if cfg.skip_relabel {
            return Ok(EntryOutcome::Processed {
                output: entry.payload.output.clone(),
                explanation: None,
            });
        }
        if entry.payload.messages.is_empty() {
            return Ok(EntryOutcome::Failed {
                message: "entry has no messages to relabel".to_string(),
            });
        }

        let resource = self.client.resource_key();
        if !self.limiter.try_acquire(resource) {
            debug!(entry = %entry.id, resource, "local rate limit reached, deferring");
            return Ok(EntryOutcome::Deferred {
                reason: format!("rate limit reached for '{}'", resource),
            });
        }

        let request = CompletionRequest::from_payload(&cfg.model, &entry.payload);
        Ok(match self.client.complete(&request).await {
            Ok(message) => EntryOutcome::Processed {
                output: Some(message),
                explanation: None,
            },
            Err(CompletionError::RateLimited(reason)) => {
                debug!(entry = %entry.id, %reason, "upstream rate limit, deferring");
                EntryOutcome::Deferred { reason }
            }
            Err(CompletionError::Failed(message)) => {
                warn!(entry = %entry.id, %message, "relabel failed");
                EntryOutcome::Failed { message }
            }
        })
    }

    fn output_label(&self, _entry: &NodeEntry) -> Option<&'static str> {
        Some(labels::RELABELED)
    }
}
