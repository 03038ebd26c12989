//! Bounded executor for one node invocation.
//!
//! Per round: list up to `read_batch_size` PENDING entries, claim them
//! (PENDING -> PROCESSING), resolve cache hits directly, and run the misses
//! through `process_entry` with at most `concurrency(node)` in flight. The
//! store lock is only held for datastore work, never across a completion
//! call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use entryflow_core::{CacheWrite, Node, NodeEntry};
use entryflow_storage::{hash_input, hash_output, PipelineStore};

use crate::error::EngineError;
use crate::processor::{EntryOutcome, NodeProcessor};

/// The store shared by the executor and the service.
///
/// `rusqlite::Connection` is `!Sync`, so access goes through an async mutex.
pub type SharedStore = Arc<Mutex<Box<dyn PipelineStore>>>;

/// Counts for one node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// True when the processor's bulk step handled the node.
    pub bulk: bool,
    pub claimed: usize,
    pub processed: usize,
    pub errored: usize,
    pub deferred: usize,
    pub cache_hits: usize,
    pub cache_writes: usize,
}

pub struct Executor {
    store: SharedStore,
}

impl Executor {
    pub fn new(store: SharedStore) -> Self {
        Executor { store }
    }

    pub async fn execute(
        &self,
        node: &Node,
        processor: Arc<dyn NodeProcessor>,
    ) -> Result<ExecutionSummary, EngineError> {
        let mut summary = ExecutionSummary::default();

        {
            let mut store = self.store.lock().await;
            if let Some(bulk) = processor.before_all(node, &mut **store)? {
                summary.bulk = true;
                summary.claimed = bulk.processed;
                summary.processed = bulk.processed;
                summary.cache_hits = bulk.cache_hits;
                summary.cache_writes = bulk.cache_writes;
                return Ok(summary);
            }
        }

        let concurrency = processor.concurrency(node)?.max(1);
        let batch_size = processor.read_batch_size().max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        debug!(node = %node.id, concurrency, batch_size, "executing node");

        loop {
            let claimed = {
                let mut store = self.store.lock().await;
                let ids: Vec<_> = store
                    .list_pending(node.id, batch_size)?
                    .into_iter()
                    .map(|e| e.id)
                    .collect();
                if ids.is_empty() {
                    break;
                }
                store.claim_entries(&ids)?
            };
            if claimed.is_empty() {
                break;
            }
            summary.claimed += claimed.len();

            let misses = self.apply_cache_hits(node, processor.as_ref(), claimed, &mut summary).await?;

            let deferred_before = summary.deferred;
            let mut tasks = JoinSet::new();
            for entry in misses {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Worker(e.to_string()))?;
                let processor = Arc::clone(&processor);
                let node = node.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = processor.process_entry(&node, &entry).await;
                    (entry, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (entry, outcome) = joined.map_err(|e| EngineError::Worker(e.to_string()))?;
                self.record(node, processor.as_ref(), &entry, outcome?, &mut summary)
                    .await?;
            }

            // Deferred entries are PENDING again; retrying them in this
            // invocation would just spin against the rate limit.
            if summary.deferred > deferred_before {
                break;
            }
        }

        info!(
            node = %node.id,
            claimed = summary.claimed,
            processed = summary.processed,
            errored = summary.errored,
            deferred = summary.deferred,
            cache_hits = summary.cache_hits,
            cache_writes = summary.cache_writes,
            "node execution complete"
        );
        Ok(summary)
    }

    /// Completes entries that have a cached result and returns the rest.
    async fn apply_cache_hits(
        &self,
        node: &Node,
        processor: &dyn NodeProcessor,
        claimed: Vec<NodeEntry>,
        summary: &mut ExecutionSummary,
    ) -> Result<Vec<NodeEntry>, EngineError> {
        let mut store = self.store.lock().await;
        let mut misses = Vec::new();
        for entry in claimed {
            let hit = store.lookup_cache(
                &node.hash,
                &entry.input_hash,
                &entry.output_hash,
                processor.cache_match_fields(node),
            )?;
            match hit {
                Some(cached) => {
                    store.record_processed(entry.id, &cached.result)?;
                    summary.cache_hits += 1;
                    summary.processed += 1;
                }
                None => misses.push(entry),
            }
        }
        Ok(misses)
    }

    async fn record(
        &self,
        node: &Node,
        processor: &dyn NodeProcessor,
        entry: &NodeEntry,
        outcome: EntryOutcome,
        summary: &mut ExecutionSummary,
    ) -> Result<(), EngineError> {
        let mut store = self.store.lock().await;
        match outcome {
            EntryOutcome::Processed {
                output,
                explanation,
            } => {
                let payload = entry.payload.with_output(output);
                let outgoing_output_hash = hash_output(&payload);
                store.put_output(&outgoing_output_hash, &payload.output_value())?;

                let result = CacheWrite {
                    outgoing_input_hash: Some(hash_input(&payload)),
                    outgoing_output_hash: Some(outgoing_output_hash),
                    filter_outcome: None,
                    explanation,
                }
                .restricted_to(processor.cache_write_fields());

                if store.write_cache(node.id, &entry.cache_key(&node.hash), &result)? {
                    summary.cache_writes += 1;
                }
                store.record_processed(entry.id, &result)?;
                summary.processed += 1;
            }
            EntryOutcome::Deferred { reason } => {
                store.record_deferred(entry.id, &reason)?;
                summary.deferred += 1;
            }
            EntryOutcome::Failed { message } => {
                warn!(node = %node.id, entry = %entry.id, %message, "entry failed");
                store.record_failed(entry.id, &message)?;
                summary.errored += 1;
            }
        }
        Ok(())
    }
}
