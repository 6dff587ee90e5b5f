//! # In-Memory Task Dispatcher
//!
//! Channel-backed dispatcher for tests and single-process embedding.
//!
//! Tasks go onto a bounded tokio mpsc channel; whoever holds the [`TaskReceiver`]
//! plays the executor pool and reports back through the orchestrator's `deliver`.
//! A bounded history of queued tasks is kept for inspection.

use super::{DispatchError, DispatchResult, RemoteTaskDispatcher};
use crate::config::DispatcherConfig;
use crate::models::{RemoteTask, TaskType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving side handed to the executor pool
pub type TaskReceiver = mpsc::Receiver<RemoteTask>;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub queued: u64,
    pub rejected: u64,
}

/// In-memory dispatcher for testing and embedding
///
/// # Example
///
/// ```rust
/// use stepwise_core::config::DispatcherConfig;
/// use stepwise_core::dispatch::{InMemoryTaskDispatcher, RemoteTaskDispatcher};
/// use stepwise_core::models::{RemoteTask, TaskScope, TaskType};
///
/// # tokio_test::block_on(async {
/// let (dispatcher, mut receiver) = InMemoryTaskDispatcher::new(&DispatcherConfig::default());
///
/// let task = RemoteTask::new(
///     TaskType::AsgResize,
///     serde_json::json!({"new_group": "web-v2"}),
///     TaskScope::default(),
///     60_000,
///     "W1",
/// );
/// let task_id = dispatcher.queue(task).await.unwrap();
///
/// let received = receiver.recv().await.unwrap();
/// assert_eq!(received.task_id, task_id);
/// # });
/// ```
#[derive(Debug)]
pub struct InMemoryTaskDispatcher {
    sender: mpsc::Sender<RemoteTask>,
    enqueue_timeout: Duration,
    history_limit: usize,
    history: RwLock<VecDeque<RemoteTask>>,
    total_queued: AtomicU64,
    total_rejected: AtomicU64,
}

impl InMemoryTaskDispatcher {
    pub fn new(config: &DispatcherConfig) -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let dispatcher = Self {
            sender,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            history_limit: config.history_limit,
            history: RwLock::new(VecDeque::new()),
            total_queued: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        };
        (dispatcher, receiver)
    }

    /// Tasks queued so far, oldest first, up to the configured history limit
    pub fn queued_tasks(&self) -> Vec<RemoteTask> {
        self.history.read().iter().cloned().collect()
    }

    pub fn tasks_of_type(&self, task_type: TaskType) -> Vec<RemoteTask> {
        self.history
            .read()
            .iter()
            .filter(|task| task.task_type == task_type)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.total_queued.load(Ordering::Relaxed),
            rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn record(&self, task: RemoteTask) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.write();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(task);
    }
}

#[async_trait]
impl RemoteTaskDispatcher for InMemoryTaskDispatcher {
    async fn queue(&self, task: RemoteTask) -> DispatchResult<String> {
        let task_id = task.task_id.clone();
        let snapshot = task.clone();

        let sent = tokio::time::timeout(self.enqueue_timeout, self.sender.send(task)).await;
        match sent {
            Ok(Ok(())) => {
                self.total_queued.fetch_add(1, Ordering::Relaxed);
                debug!(
                    task_id = %task_id,
                    task_type = %snapshot.task_type,
                    wait_id = %snapshot.wait_id,
                    "Queued remote task"
                );
                self.record(snapshot);
                Ok(task_id)
            }
            Ok(Err(_)) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task_id, "Executor pool receiver dropped");
                Err(DispatchError::Closed)
            }
            Err(_) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::QueueTimeout {
                    task_id,
                    timeout_ms: self.enqueue_timeout.as_millis() as u64,
                })
            }
        }
    }
}
