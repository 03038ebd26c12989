//! Task-queue seam.
//!
//! The pipeline decides *what* to schedule; the owner of the queue decides
//! *when* it runs. [`InMemoryQueue`] is the in-process implementation used by
//! the CLI `run` command and by tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use entryflow_core::{NodeId, NodeType};

use crate::error::EngineError;

/// A scheduled node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuedTask {
    pub node_id: NodeId,
    pub node_type: NodeType,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, node_id: NodeId, node_type: NodeType) -> Result<(), EngineError>;
}

/// FIFO queue that coalesces a node already waiting to run.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    tasks: Mutex<VecDeque<QueuedTask>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pop(&self) -> Option<QueuedTask> {
        self.tasks.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, node_id: NodeId, node_type: NodeType) -> Result<(), EngineError> {
        let task = QueuedTask { node_id, node_type };
        let mut tasks = self.tasks.lock().await;
        if !tasks.contains(&task) {
            tasks.push_back(task);
        }
        Ok(())
    }
}
