//! Execution engine for entryflow pipelines.
//!
//! Runs one node invocation at a time on behalf of an external scheduler:
//! claims PENDING entries, answers what it can from the content-addressed
//! cache, processes the rest under a per-node concurrency cap, forwards
//! results to destination nodes and enqueues them.
//!
//! # Modules
//!
//! - [`config`]: environment-driven [`PipelineConfig`]
//! - [`error`]: EngineError enum
//! - [`rate_limit`]: shared token-bucket [`RateLimiter`]
//! - [`llm`]: completion client seam and the OpenAI-compatible client
//! - [`queue`]: task-queue seam used to schedule node invocations
//! - [`processor`]: per-node-type [`NodeProcessor`] strategies
//! - [`executor`]: bounded executor for one node invocation
//! - [`service`]: [`PipelineService`], the entry points exposed to schedulers

pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod service;

pub use config::{LlmConfig, PipelineConfig};
pub use error::EngineError;
pub use executor::{ExecutionSummary, Executor, SharedStore};
pub use llm::{CompletionClient, CompletionError, CompletionRequest, OpenAiCompatibleClient};
pub use processor::{EntryOutcome, NodeProcessor, ProcessorRegistry};
pub use queue::{InMemoryQueue, QueuedTask, TaskQueue};
pub use rate_limit::RateLimiter;
pub use service::{NodeRunReport, PipelineService};
