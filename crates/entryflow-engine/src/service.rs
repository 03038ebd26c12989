//! [`PipelineService`]: the operations a scheduler calls.
//!
//! - [`process_node`](PipelineService::process_node) runs one invocation of a
//!   node: stale-claim recovery, bounded execution, forwarding of processed
//!   entries to destination nodes, and enqueueing of follow-up work.
//! - [`invalidate`](PipelineService::invalidate) resets a node and drops the
//!   entries derived from it downstream.
//! - [`update_node_config`](PipelineService::update_node_config) changes a
//!   node's configuration and carries cached results over when they remain
//!   valid.
//!
//! The service holds the store behind `Arc<tokio::sync::Mutex<..>>`; the
//! scheduler must not run two invocations of the same node at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use entryflow_core::{
    CoreError, EntryPayload, Node, NodeConfig, NodeEntry, NodeEntryId, NodeGraph, NodeId, Traversal,
};
use entryflow_storage::{ChildEntry, InvalidationReport, PipelineStore, StorageError};

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::executor::{ExecutionSummary, Executor, SharedStore};
use crate::processor::{NodeProcessor, ProcessorRegistry};
use crate::queue::TaskQueue;

/// Outcome of one `process_node` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRunReport {
    pub run_id: Uuid,
    pub node_id: NodeId,
    /// Stale PROCESSING claims returned to PENDING before execution.
    pub recovered: usize,
    pub summary: ExecutionSummary,
    /// Child entries created at destination nodes.
    pub forwarded: usize,
    /// Nodes enqueued by this invocation (destinations, then itself if it
    /// deferred work).
    pub enqueued: Vec<NodeId>,
}

pub struct PipelineService {
    store: SharedStore,
    registry: ProcessorRegistry,
    queue: Arc<dyn TaskQueue>,
    config: Arc<PipelineConfig>,
}

impl PipelineService {
    pub fn new(
        store: Box<dyn PipelineStore>,
        registry: ProcessorRegistry,
        queue: Arc<dyn TaskQueue>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        PipelineService {
            store: Arc::new(tokio::sync::Mutex::new(store)),
            registry,
            queue,
            config,
        }
    }

    /// The shared store, for callers that need direct reads.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one invocation of `node_id`.
    ///
    /// Errors are node-fatal and abort the invocation; entry-level failures
    /// are recorded on the entries and reported in the summary.
    pub async fn process_node(&self, node_id: NodeId) -> Result<NodeRunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("process_node", %run_id, node = %node_id);
        self.process_node_inner(run_id, node_id).instrument(span).await
    }

    async fn process_node_inner(
        &self,
        run_id: Uuid,
        node_id: NodeId,
    ) -> Result<NodeRunReport, EngineError> {
        let (node, recovered) = {
            let mut store = self.store.lock().await;
            let node = store.get_node(node_id)?;
            let recovered = store.recover_stale(Some(node_id), self.config.stale_after())?;
            (node, recovered)
        };
        let processor = self.registry.get(node.node_type())?;

        let summary = Executor::new(self.store())
            .execute(&node, Arc::clone(&processor))
            .await?;

        let (forwarded, destinations, graph) = self.forward(&node, processor.as_ref()).await?;

        let mut enqueued = Vec::new();
        for destination in destinations {
            if let Some(dest) = graph.node(destination) {
                self.queue.enqueue(dest.id, dest.node_type()).await?;
                enqueued.push(dest.id);
            }
        }
        if summary.deferred > 0 {
            self.queue.enqueue(node.id, node.node_type()).await?;
            enqueued.push(node.id);
        }

        info!(
            recovered,
            processed = summary.processed,
            errored = summary.errored,
            deferred = summary.deferred,
            forwarded,
            enqueued = enqueued.len(),
            "node invocation finished"
        );

        Ok(NodeRunReport {
            run_id,
            node_id,
            recovered,
            summary,
            forwarded,
            enqueued,
        })
    }

    /// Creates child entries at every destination of each processed entry's
    /// output. Returns the number created and the destinations that received
    /// at least one.
    async fn forward(
        &self,
        node: &Node,
        processor: &dyn NodeProcessor,
    ) -> Result<(usize, Vec<NodeId>, NodeGraph), EngineError> {
        let mut store = self.store.lock().await;
        let graph = store.load_graph(node.project_id)?;
        let processed = store.list_processed(node.id)?;

        let mut by_destination: BTreeMap<NodeId, Vec<ChildEntry>> = BTreeMap::new();
        for entry in processed {
            let Some(label) = processor.output_label(&entry) else {
                continue;
            };
            if !processor.outputs().contains(&label) {
                return Err(CoreError::InvalidConfig {
                    reason: format!(
                        "{} processor routed entry {} through undeclared output '{}'",
                        processor.node_type(),
                        entry.id,
                        label
                    ),
                }
                .into());
            }
            let destinations = graph.destinations(node.id, label)?;
            if destinations.is_empty() {
                continue;
            }
            let payload = outgoing_payload(&**store, &entry)?;
            for destination in destinations {
                by_destination.entry(destination).or_default().push(ChildEntry {
                    destination,
                    parent: entry.id,
                    payload: payload.clone(),
                });
            }
        }

        let mut forwarded = 0;
        let mut received = Vec::new();
        for (destination, children) in by_destination {
            let inserted = store.insert_child_entries(&children)?;
            if inserted > 0 {
                forwarded += inserted;
                received.push(destination);
            }
        }
        Ok((forwarded, received, graph))
    }

    /// Resets `node_id` to PENDING, deletes entries derived from it and
    /// enqueues it.
    pub async fn invalidate(&self, node_id: NodeId) -> Result<InvalidationReport, EngineError> {
        let (node, report) = {
            let mut store = self.store.lock().await;
            let node = store.get_node(node_id)?;
            let report = store.invalidate_descendants(node_id)?;
            (node, report)
        };
        self.queue.enqueue(node.id, node.node_type()).await?;
        info!(node = %node_id, reset = report.reset, deleted = report.deleted_descendants, "node invalidated");
        Ok(report)
    }

    /// Replaces a node's configuration.
    ///
    /// When the node hash changes the node is invalidated and enqueued; if
    /// its processor says the new configuration subsumes the old one, the old
    /// cache rows are copied to the new hash. The store applies the update,
    /// the copy and the invalidation in one transaction.
    pub async fn update_node_config(
        &self,
        node_id: NodeId,
        config: &NodeConfig,
    ) -> Result<Node, EngineError> {
        let change = {
            let mut store = self.store.lock().await;
            let previous = store.get_node(node_id)?;
            let processor = self.registry.get(previous.node_type())?;
            let carry_cache = processor.subsumes(&previous.config, config);
            store.replace_config(node_id, config, carry_cache)?
        };

        if let Some(report) = change.invalidation {
            info!(
                node = %node_id,
                carried = change.carried,
                reset = report.reset,
                deleted = report.deleted_descendants,
                "node config changed"
            );
            self.queue.enqueue(change.node.id, change.node.node_type()).await?;
        }
        Ok(change.node)
    }

    /// Returns PROCESSING entries older than the stale threshold to PENDING,
    /// for one node or all of them.
    pub async fn recover_stale(&self, node_id: Option<NodeId>) -> Result<usize, EngineError> {
        let mut store = self.store.lock().await;
        Ok(store.recover_stale(node_id, self.config.stale_after())?)
    }

    /// Adds source entries to a node and enqueues it.
    pub async fn ingest(
        &self,
        node_id: NodeId,
        payloads: &[EntryPayload],
    ) -> Result<Vec<NodeEntryId>, EngineError> {
        let (node, ids) = {
            let mut store = self.store.lock().await;
            let node = store.get_node(node_id)?;
            let ids = store.insert_entries(node_id, payloads)?;
            (node, ids)
        };
        if !ids.is_empty() {
            self.queue.enqueue(node.id, node.node_type()).await?;
        }
        Ok(ids)
    }

    /// Nodes downstream of `node_id`.
    pub async fn descendants(
        &self,
        node_id: NodeId,
        traversal: Traversal,
    ) -> Result<Vec<NodeId>, EngineError> {
        let store = self.store.lock().await;
        let node = store.get_node(node_id)?;
        let graph = store.load_graph(node.project_id)?;
        Ok(graph.descendants(node_id, traversal)?)
    }
}

/// The payload a processed entry hands to its children: its input with the
/// output it produced at this node.
fn outgoing_payload(store: &dyn PipelineStore, entry: &NodeEntry) -> Result<EntryPayload, EngineError> {
    match &entry.outgoing_output_hash {
        Some(hash) if *hash != entry.output_hash => {
            let output = store.get_output(hash)?.ok_or_else(|| StorageError::IntegrityError {
                reason: format!("entry {} refers to missing output {}", entry.id, hash),
            })?;
            Ok(entry
                .payload
                .with_output(Some(output).filter(|value| !value.is_null())))
        }
        _ => Ok(entry.payload.clone()),
    }
}
