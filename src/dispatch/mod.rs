//! # Remote Task Dispatcher
//!
//! The only way the engine causes real-world side effects: a state hands a
//! [`RemoteTask`] to the dispatcher and the external executor pool picks it up.
//! Dispatchers never retry; a state may re-queue on a recognized transient failure.

pub mod in_memory;

use crate::models::RemoteTask;
use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::{DispatcherStats, InMemoryTaskDispatcher, TaskReceiver};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Executor pool is not accepting tasks")]
    Closed,

    #[error("Timed out queueing task {task_id} after {timeout_ms}ms")]
    QueueTimeout { task_id: String, timeout_ms: u64 },

    #[error("Task {task_id} rejected: {reason}")]
    Rejected { task_id: String, reason: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Hands serialized work to the external executor pool
#[async_trait]
pub trait RemoteTaskDispatcher: Send + Sync {
    /// Make the task visible to executors and return its task id
    async fn queue(&self, task: RemoteTask) -> DispatchResult<String>;
}
