//! entryflow pipeline CLI.
//!
//! Provides the `entryflow` binary, which drives a [`PipelineService`] against
//! a SQLite database. Configuration comes from `ENTRYFLOW_*` environment
//! variables (see [`PipelineConfig::from_env`]); `--db` overrides the database
//! path. Results are printed as JSON on stdout, logs go to stderr and are
//! filtered with `RUST_LOG`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use entryflow_core::{EntryPayload, NodeConfig, NodeId, ProjectId, Traversal};
use entryflow_engine::{
    EngineError, InMemoryQueue, NodeRunReport, OpenAiCompatibleClient, PipelineConfig,
    PipelineService, ProcessorRegistry, RateLimiter, TaskQueue,
};
use entryflow_storage::{PipelineStore, SqliteStore, StorageError};

/// Incremental, content-addressed data pipeline.
#[derive(Parser)]
#[command(name = "entryflow", about = "Incremental content-addressed data pipeline")]
struct Cli {
    /// SQLite database file (overrides ENTRYFLOW_DB_PATH).
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a node from a JSON configuration, e.g. '{"type":"Dataset","dataset_id":1}'.
    AddNode {
        #[arg(short, long, default_value_t = 1)]
        project: i64,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        config: String,
    },

    /// Connect a node's named output to a destination node.
    Connect {
        #[arg(long)]
        from: i64,
        /// Output label (Entries, Passed, Failed, Relabeled).
        #[arg(long)]
        label: String,
        #[arg(long)]
        to: i64,
    },

    /// Replace a node's configuration; invalidates the node when its hash changes.
    SetConfig {
        #[arg(short, long)]
        node: i64,
        #[arg(short, long)]
        config: String,
    },

    /// Add entries to a node from a JSON Lines file (one record per line).
    Ingest {
        #[arg(short, long)]
        node: i64,
        file: PathBuf,
    },

    /// Run one invocation of a node.
    Process {
        #[arg(short, long)]
        node: i64,
    },

    /// Run a node, then every node it enqueues, until the queue is empty.
    Run {
        #[arg(short, long)]
        node: i64,

        /// Stop after this many node invocations.
        #[arg(long, default_value_t = 1000)]
        max_invocations: usize,
    },

    /// Reset a node to PENDING and delete entries derived from it.
    Invalidate {
        #[arg(short, long)]
        node: i64,
    },

    /// Return stale PROCESSING entries to PENDING (all nodes when --node is omitted).
    Recover {
        #[arg(short, long)]
        node: Option<i64>,
    },

    /// List the nodes downstream of a node.
    Descendants {
        #[arg(short, long)]
        node: i64,

        /// Direct neighbours only.
        #[arg(long)]
        one_hop: bool,
    },

    /// Show a node's entry counts by status.
    Status {
        #[arg(short, long)]
        node: i64,
    },
}

/// Failure classes, mapped to exit codes: 1 = pipeline error,
/// 2 = configuration error, 3 = bad input.
#[derive(Debug)]
enum Failure {
    Engine(EngineError),
    Input(String),
    Output(String),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Engine(EngineError::Config(_)) => 2,
            Failure::Engine(_) | Failure::Output(_) => 1,
            Failure::Input(_) => 3,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Engine(e) => write!(f, "{}", e),
            Failure::Input(msg) => write!(f, "invalid input: {}", msg),
            Failure::Output(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

impl From<StorageError> for Failure {
    fn from(e: StorageError) -> Self {
        Failure::Engine(EngineError::Storage(e))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(failure) = run(cli).await {
        eprintln!("Error: {}", failure);
        process::exit(failure.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), Failure> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate()?;

    let queue = Arc::new(InMemoryQueue::new());
    let service = build_service(config, Arc::clone(&queue))?;

    match cli.command {
        Commands::AddNode {
            project,
            name,
            config,
        } => {
            let config = parse_config(&config)?;
            let node = service
                .store()
                .lock()
                .await
                .create_node(ProjectId(project), &name, &config)?;
            print_json(&node)
        }
        Commands::Connect { from, label, to } => {
            let store = service.store();
            let mut store = store.lock().await;
            let output = store.output_by_label(NodeId(from), &label)?;
            let channel = store.connect(output.id, NodeId(to))?;
            print_json(&channel)
        }
        Commands::SetConfig { node, config } => {
            let config = parse_config(&config)?;
            let node = service.update_node_config(NodeId(node), &config).await?;
            print_json(&node)
        }
        Commands::Ingest { node, file } => {
            let payloads = read_jsonl(&file)?;
            let ids = service.ingest(NodeId(node), &payloads).await?;
            info!(node, inserted = ids.len(), "ingested entries");
            print_json(&ids)
        }
        Commands::Process { node } => {
            let report = service.process_node(NodeId(node)).await?;
            print_json(&report)
        }
        Commands::Run {
            node,
            max_invocations,
        } => {
            let reports = drain(&service, &queue, NodeId(node), max_invocations).await?;
            print_json(&reports)
        }
        Commands::Invalidate { node } => {
            let report = service.invalidate(NodeId(node)).await?;
            print_json(&report)
        }
        Commands::Recover { node } => {
            let recovered = service.recover_stale(node.map(NodeId)).await?;
            print_json(&serde_json::json!({ "recovered": recovered }))
        }
        Commands::Descendants { node, one_hop } => {
            let traversal = if one_hop {
                Traversal::OneHop
            } else {
                Traversal::Transitive
            };
            let nodes = service.descendants(NodeId(node), traversal).await?;
            print_json(&nodes)
        }
        Commands::Status { node } => {
            let counts = service.store().lock().await.status_counts(NodeId(node))?;
            print_json(&counts)
        }
    }
}

fn build_service(config: PipelineConfig, queue: Arc<InMemoryQueue>) -> Result<PipelineService, Failure> {
    let store: Box<dyn PipelineStore> = Box::new(SqliteStore::new(&config.db_path)?);
    let client = Arc::new(OpenAiCompatibleClient::from_config(&config.llm));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_capacity,
        config.rate_limit_fill_rate,
    ));
    let config = Arc::new(config);
    let registry = ProcessorRegistry::standard(Arc::clone(&config), client, limiter);
    Ok(PipelineService::new(store, registry, queue, config))
}

/// Processes `start`, then pops and processes queued nodes until the queue
/// drains or `max_invocations` is reached.
async fn drain(
    service: &PipelineService,
    queue: &InMemoryQueue,
    start: NodeId,
    max_invocations: usize,
) -> Result<Vec<NodeRunReport>, Failure> {
    let mut reports = Vec::new();
    let mut next = Some(start);

    while let Some(node_id) = next {
        if reports.len() >= max_invocations {
            let pending = queue.len().await;
            warn!(max_invocations, pending, "invocation limit reached");
            break;
        }
        let report = service.process_node(node_id).await?;
        let stalled = report.summary.deferred > 0
            && report.summary.processed == 0
            && report.forwarded == 0;
        reports.push(report);
        if stalled {
            // Only rate-limited work is left for this node; retrying now
            // would not make progress.
            warn!(node = %node_id, "node deferred all work, leaving it queued");
            next = pop_other_than(queue, node_id).await;
        } else {
            next = queue.pop().await.map(|task| task.node_id);
        }
    }
    Ok(reports)
}

/// Pops the next queued node that is not `skip`; `skip` stays queued.
async fn pop_other_than(queue: &InMemoryQueue, skip: NodeId) -> Option<NodeId> {
    let mut skipped = None;
    let mut found = None;
    while let Some(task) = queue.pop().await {
        if task.node_id == skip {
            skipped = Some(task);
            continue;
        }
        found = Some(task.node_id);
        break;
    }
    if let Some(task) = skipped {
        if let Err(e) = queue.enqueue(task.node_id, task.node_type).await {
            warn!(node = %task.node_id, error = %e, "failed to requeue node");
        }
    }
    found
}

fn parse_config(raw: &str) -> Result<NodeConfig, Failure> {
    serde_json::from_str(raw).map_err(|e| Failure::Input(format!("node config: {}", e)))
}

fn read_jsonl(path: &Path) -> Result<Vec<EntryPayload>, Failure> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Failure::Input(format!("failed to read '{}': {}", path.display(), e)))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| Failure::Input(format!("{}:{}: {}", path.display(), n + 1, e)))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Failure> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Failure::Output(format!("failed to serialize result: {}", e)))?;
    println!("{}", json);
    Ok(())
}
