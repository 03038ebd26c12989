//! End-to-end tests for PipelineService over an in-memory SQLite store, with
//! a scripted completion client and the in-process queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use entryflow_core::node::labels;
use entryflow_core::{
    DatasetConfig, EntryPayload, EntryStatus, FilterComparator, FilterConfig, FilterOutcome,
    FilterPredicate, LlmRelabelConfig, Node, NodeConfig, NodeId, ProjectId,
};
use entryflow_engine::llm::assistant_message;
use entryflow_engine::{
    CompletionClient, CompletionError, CompletionRequest, EngineError, InMemoryQueue,
    PipelineConfig, PipelineService, ProcessorRegistry, RateLimiter,
};
use entryflow_storage::{PipelineStore, SqliteStore};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

enum Script {
    /// Reply with "relabeled: <last user content>".
    Echo,
    RateLimited,
    /// Fail entries whose last message contains the given text.
    FailOn(&'static str),
}

struct ScriptedClient {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    fn new(script: Script) -> Self {
        ScriptedClient {
            script,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn resource_key(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let last = request
            .messages
            .last()
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        match self.script {
            Script::Echo => Ok(assistant_message(&format!("relabeled: {last}"))),
            Script::RateLimited => Err(CompletionError::RateLimited("slow down".into())),
            Script::FailOn(needle) if last.contains(needle) => {
                Err(CompletionError::Failed(format!("cannot relabel '{last}'")))
            }
            Script::FailOn(_) => Ok(assistant_message("ok")),
        }
    }
}

struct Harness {
    service: PipelineService,
    queue: Arc<InMemoryQueue>,
    client: Arc<ScriptedClient>,
}

fn harness_with(client: ScriptedClient, limiter: RateLimiter, config: PipelineConfig) -> Harness {
    let config = Arc::new(config);
    let client = Arc::new(client);
    let queue = Arc::new(InMemoryQueue::new());
    let registry = ProcessorRegistry::standard(config.clone(), client.clone(), Arc::new(limiter));
    let store: Box<dyn PipelineStore> = Box::new(SqliteStore::in_memory().unwrap());
    Harness {
        service: PipelineService::new(store, registry, queue.clone(), config),
        queue,
        client,
    }
}

fn harness(client: ScriptedClient) -> Harness {
    harness_with(client, RateLimiter::new(1000.0, 0.0), PipelineConfig::default())
}

impl Harness {
    async fn node(&self, name: &str, config: NodeConfig) -> Node {
        self.service
            .store()
            .lock()
            .await
            .create_node(ProjectId(1), name, &config)
            .unwrap()
    }

    async fn connect(&self, from: &Node, label: &str, to: &Node) {
        let store = self.service.store();
        let mut store = store.lock().await;
        let output = store.output_by_label(from.id, label).unwrap();
        store.connect(output.id, to.id).unwrap();
    }

    async fn entries(&self, node: NodeId) -> Vec<entryflow_core::NodeEntry> {
        self.service.store().lock().await.list_entries(node).unwrap()
    }
}

fn dataset() -> NodeConfig {
    NodeConfig::Dataset(DatasetConfig { dataset_id: 1 })
}

fn contains(field: &str, value: &str) -> NodeConfig {
    NodeConfig::Filter(FilterConfig {
        filters: vec![FilterPredicate::new(field, FilterComparator::Contains, value)],
    })
}

fn relabel(model: &str) -> NodeConfig {
    NodeConfig::LlmRelabel(LlmRelabelConfig {
        model: model.into(),
        skip_relabel: false,
        max_concurrency: None,
    })
}

fn content(text: &str) -> EntryPayload {
    serde_json::from_value(json!({ "content": text })).unwrap()
}

fn prompt(text: &str) -> EntryPayload {
    serde_json::from_value(json!({
        "messages": [{ "role": "user", "content": text }]
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filter_end_to_end_reuses_cache_on_rerun() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let source = h.node("source", dataset()).await;
    let filter = h.node("has-x", contains("content", "X")).await;
    h.connect(&source, labels::ENTRIES, &filter).await;

    h.service
        .ingest(source.id, &[content("X123"), content("abc")])
        .await
        .unwrap();
    let report = h.service.process_node(source.id).await.unwrap();
    assert_eq!(report.summary.processed, 2);
    assert_eq!(report.forwarded, 2);
    assert_eq!(report.enqueued, vec![filter.id]);

    let first = h.service.process_node(filter.id).await.unwrap();
    assert!(first.summary.bulk);
    assert_eq!(first.summary.cache_writes, 2);
    let outcomes: Vec<_> = h
        .entries(filter.id)
        .await
        .into_iter()
        .map(|e| e.filter_outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![Some(FilterOutcome::Passed), Some(FilterOutcome::Failed)]
    );

    h.service.invalidate(filter.id).await.unwrap();
    let second = h.service.process_node(filter.id).await.unwrap();
    assert_eq!(second.summary.cache_writes, 0);
    assert_eq!(second.summary.cache_hits, 2);
    let rerun: Vec<_> = h
        .entries(filter.id)
        .await
        .into_iter()
        .map(|e| e.filter_outcome)
        .collect();
    assert_eq!(rerun, outcomes);
}

#[tokio::test]
async fn filter_routes_by_outcome() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let filter = h.node("has-x", contains("content", "X")).await;
    let passed = h.node("passed", contains("content", "")).await;
    let failed = h.node("failed", contains("content", "")).await;
    h.connect(&filter, labels::PASSED, &passed).await;
    h.connect(&filter, labels::FAILED, &failed).await;

    h.service
        .ingest(filter.id, &[content("X1"), content("X2"), content("y")])
        .await
        .unwrap();
    let report = h.service.process_node(filter.id).await.unwrap();

    assert_eq!(report.forwarded, 3);
    assert_eq!(h.entries(passed.id).await.len(), 2);
    assert_eq!(h.entries(failed.id).await.len(), 1);
    assert_eq!(report.enqueued, vec![passed.id, failed.id]);

    // Forwarding is idempotent per (destination, parent).
    let again = h.service.process_node(filter.id).await.unwrap();
    assert_eq!(again.forwarded, 0);
    assert!(again.enqueued.is_empty());
}

#[tokio::test]
async fn filter_rerun_over_claimed_entries_classifies_each_once() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let filter = h.node("has-x", contains("content", "X")).await;
    let ids = h
        .service
        .ingest(
            filter.id,
            &[content("X1"), content("a"), content("X2"), content("b")],
        )
        .await
        .unwrap();
    // An earlier invocation died after claiming half the entries.
    h.service.store().lock().await.claim_entries(&ids[..2]).unwrap();

    let report = h.service.process_node(filter.id).await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.summary.processed, 4);

    let entries = h.entries(filter.id).await;
    assert!(entries.iter().all(|e| e.status == EntryStatus::Processed));
    let outcomes: Vec<_> = entries.iter().map(|e| e.filter_outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(FilterOutcome::Passed),
            Some(FilterOutcome::Failed),
            Some(FilterOutcome::Passed),
            Some(FilterOutcome::Failed),
        ]
    );
    let rows = h
        .service
        .store()
        .lock()
        .await
        .count_cache_rows(&filter.hash)
        .unwrap();
    assert_eq!(rows, 4);

    // A second pass over the same entries writes nothing new.
    h.service.invalidate(filter.id).await.unwrap();
    let again = h.service.process_node(filter.id).await.unwrap();
    assert_eq!(again.summary.cache_hits, 4);
    assert_eq!(again.summary.cache_writes, 0);
    let rows = h
        .service
        .store()
        .lock()
        .await
        .count_cache_rows(&filter.hash)
        .unwrap();
    assert_eq!(rows, 4);
}

// ---------------------------------------------------------------------------
// LLMRelabel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_rate_limit_leaves_entry_pending() {
    let h = harness(ScriptedClient::new(Script::RateLimited));
    let node = h.node("relabel", relabel("m")).await;
    h.service.ingest(node.id, &[prompt("hello")]).await.unwrap();

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.summary.deferred, 1);
    assert_eq!(report.summary.errored, 0);
    assert_eq!(report.enqueued, vec![node.id]);

    let entries = h.entries(node.id).await;
    assert_eq!(entries[0].status, EntryStatus::Pending);
    assert_eq!(entries[0].diagnostic.as_deref(), Some("slow down"));
    assert!(entries[0].error.is_none());

    let pending = h.service.store().lock().await.list_pending(node.id, 10).unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn second_run_makes_no_external_calls() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let node = h.node("relabel", relabel("m")).await;
    h.service
        .ingest(node.id, &[prompt("one"), prompt("two")])
        .await
        .unwrap();

    let first = h.service.process_node(node.id).await.unwrap();
    assert_eq!(first.summary.processed, 2);
    assert_eq!(first.summary.cache_writes, 2);
    assert_eq!(h.client.calls(), 2);
    let before: Vec<_> = h
        .entries(node.id)
        .await
        .into_iter()
        .map(|e| e.outgoing_output_hash)
        .collect();

    h.service.invalidate(node.id).await.unwrap();
    let second = h.service.process_node(node.id).await.unwrap();
    assert_eq!(second.summary.cache_hits, 2);
    assert_eq!(second.summary.cache_writes, 0);
    assert_eq!(h.client.calls(), 2);

    let after: Vec<_> = h
        .entries(node.id)
        .await
        .into_iter()
        .map(|e| e.outgoing_output_hash)
        .collect();
    assert_eq!(before, after);
    assert!(after.iter().all(Option::is_some));
}

#[tokio::test]
async fn entry_failures_do_not_abort_the_batch() {
    let h = harness(ScriptedClient::new(Script::FailOn("bad")));
    let node = h.node("relabel", relabel("m")).await;
    h.service
        .ingest(node.id, &[prompt("good"), prompt("bad"), content("no messages")])
        .await
        .unwrap();

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.summary.processed, 1);
    assert_eq!(report.summary.errored, 2);

    let entries = h.entries(node.id).await;
    assert_eq!(entries[0].status, EntryStatus::Processed);
    assert_eq!(entries[1].status, EntryStatus::Error);
    assert!(entries[1].error.as_deref().unwrap().contains("bad"));
    assert_eq!(entries[2].status, EntryStatus::Error);
    // Only the two entries with messages reached the client.
    assert_eq!(h.client.calls(), 2);
}

#[tokio::test]
async fn exhausted_local_limiter_defers_without_calling() {
    let config = PipelineConfig {
        default_concurrency: 1,
        ..PipelineConfig::default()
    };
    let h = harness_with(
        ScriptedClient::new(Script::Echo),
        RateLimiter::new(1.0, 0.0),
        config,
    );
    let node = h.node("relabel", relabel("m")).await;
    h.service
        .ingest(node.id, &[prompt("a"), prompt("b"), prompt("c")])
        .await
        .unwrap();

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.summary.processed, 1);
    assert_eq!(report.summary.deferred, 2);
    assert_eq!(h.client.calls(), 1);

    let counts = h.service.store().lock().await.status_counts(node.id).unwrap();
    assert_eq!(counts.get(EntryStatus::Pending), 2);
    assert_eq!(counts.get(EntryStatus::Processed), 1);
}

#[tokio::test]
async fn concurrency_cap_bounds_in_flight_calls() {
    let h = harness(ScriptedClient::new(Script::Echo).with_delay(Duration::from_millis(20)));
    let node = h
        .node(
            "relabel",
            NodeConfig::LlmRelabel(LlmRelabelConfig {
                model: "m".into(),
                skip_relabel: false,
                max_concurrency: Some(2),
            }),
        )
        .await;
    let prompts: Vec<_> = (0..6).map(|i| prompt(&format!("p{i}"))).collect();
    h.service.ingest(node.id, &prompts).await.unwrap();

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.summary.processed, 6);
    assert_eq!(h.client.calls(), 6);
    assert_eq!(h.client.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn relabeled_output_is_forwarded() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let node = h.node("relabel", relabel("m")).await;
    let check = h.node("check", contains("output.content", "relabeled")).await;
    h.connect(&node, labels::RELABELED, &check).await;

    h.service.ingest(node.id, &[prompt("hi")]).await.unwrap();
    h.service.process_node(node.id).await.unwrap();

    let children = h.entries(check.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(
        children[0].payload.output,
        Some(assistant_message("relabeled: hi"))
    );

    let report = h.service.process_node(check.id).await.unwrap();
    assert_eq!(report.summary.processed, 1);
    assert_eq!(
        h.entries(check.id).await[0].filter_outcome,
        Some(FilterOutcome::Passed)
    );
}

#[tokio::test]
async fn skipped_relabel_config_change_carries_cache_over() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let skip = |model: &str| {
        NodeConfig::LlmRelabel(LlmRelabelConfig {
            model: model.into(),
            skip_relabel: true,
            max_concurrency: None,
        })
    };
    let node = h.node("relabel", skip("a")).await;
    let payload: EntryPayload = serde_json::from_value(json!({
        "messages": [{ "role": "user", "content": "q" }],
        "output": { "role": "assistant", "content": "kept" }
    }))
    .unwrap();
    h.service.ingest(node.id, &[payload]).await.unwrap();
    h.service.process_node(node.id).await.unwrap();
    assert_eq!(h.client.calls(), 0);
    while h.queue.pop().await.is_some() {}

    let updated = h.service.update_node_config(node.id, &skip("b")).await.unwrap();
    assert_ne!(updated.hash, node.hash);
    let copied = h
        .service
        .store()
        .lock()
        .await
        .count_cache_rows(&updated.hash)
        .unwrap();
    assert_eq!(copied, 1);
    assert_eq!(h.queue.pop().await.map(|t| t.node_id), Some(node.id));

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.summary.cache_hits, 1);
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn skipped_relabel_passes_each_entry_output_through() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let node = h
        .node(
            "relabel",
            NodeConfig::LlmRelabel(LlmRelabelConfig {
                model: "m".into(),
                skip_relabel: true,
                max_concurrency: None,
            }),
        )
        .await;
    let sink = h.node("sink", contains("content", "")).await;
    h.connect(&node, labels::RELABELED, &sink).await;

    let same_prompt = |output: &str| -> EntryPayload {
        serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "same" }],
            "output": output
        }))
        .unwrap()
    };
    h.service.ingest(node.id, &[same_prompt("A")]).await.unwrap();
    h.service.process_node(node.id).await.unwrap();
    h.service.ingest(node.id, &[same_prompt("B")]).await.unwrap();
    let second = h.service.process_node(node.id).await.unwrap();
    assert_eq!(second.summary.cache_hits, 0);

    let outputs: Vec<_> = h
        .entries(sink.id)
        .await
        .into_iter()
        .map(|e| e.payload.output)
        .collect();
    assert_eq!(outputs, vec![Some(json!("A")), Some(json!("B"))]);
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn model_change_invalidates_without_copying() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let node = h.node("relabel", relabel("a")).await;
    h.service.ingest(node.id, &[prompt("q")]).await.unwrap();
    h.service.process_node(node.id).await.unwrap();

    let updated = h.service.update_node_config(node.id, &relabel("b")).await.unwrap();
    let rows = h
        .service
        .store()
        .lock()
        .await
        .count_cache_rows(&updated.hash)
        .unwrap();
    assert_eq!(rows, 0);
    assert_eq!(h.entries(node.id).await[0].status, EntryStatus::Pending);

    h.service.process_node(node.id).await.unwrap();
    assert_eq!(h.client.calls(), 2);
}

// ---------------------------------------------------------------------------
// Invalidation, recovery and node-fatal errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalidation_deletes_downstream_entries() {
    let h = harness(ScriptedClient::new(Script::Echo));
    let source = h.node("source", dataset()).await;
    let filter = h.node("has-x", contains("content", "X")).await;
    let sibling = h.node("other-source", dataset()).await;
    h.connect(&source, labels::ENTRIES, &filter).await;

    h.service.ingest(source.id, &[content("X")]).await.unwrap();
    h.service.ingest(sibling.id, &[content("Y")]).await.unwrap();
    h.service.process_node(source.id).await.unwrap();
    h.service.process_node(sibling.id).await.unwrap();
    h.service.process_node(filter.id).await.unwrap();

    let report = h.service.invalidate(source.id).await.unwrap();
    assert_eq!(report.reset, 1);
    assert_eq!(report.deleted_descendants, 1);
    assert!(h.entries(filter.id).await.is_empty());
    assert_eq!(h.entries(sibling.id).await[0].status, EntryStatus::Processed);
}

#[tokio::test]
async fn stale_claims_are_recovered_before_execution() {
    let config = PipelineConfig {
        stale_processing_secs: 0,
        ..PipelineConfig::default()
    };
    let h = harness_with(
        ScriptedClient::new(Script::Echo),
        RateLimiter::new(10.0, 0.0),
        config,
    );
    let node = h.node("relabel", relabel("m")).await;
    let ids = h.service.ingest(node.id, &[prompt("a")]).await.unwrap();
    h.service.store().lock().await.claim_entries(&ids).unwrap();

    let report = h.service.process_node(node.id).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.summary.processed, 1);
}

#[tokio::test]
async fn missing_processor_is_node_fatal() {
    let store: Box<dyn PipelineStore> = Box::new(SqliteStore::in_memory().unwrap());
    let service = PipelineService::new(
        store,
        ProcessorRegistry::new(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(PipelineConfig::default()),
    );
    let node = service
        .store()
        .lock()
        .await
        .create_node(ProjectId(1), "f", &contains("content", "X"))
        .unwrap();

    let err = service.process_node(node.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NoProcessor(_)));
}

#[tokio::test]
async fn unknown_node_is_node_fatal() {
    let h = harness(ScriptedClient::new(Script::Echo));
    assert!(matches!(
        h.service.process_node(NodeId(42)).await,
        Err(EngineError::Storage(_))
    ));
}
