use crate::constants::events;
use crate::state_machine::{ExecutionStatus, InstanceEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    InstanceTransitioned {
        instance_id: Uuid,
        workflow_execution_id: String,
        state_name: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
        event: InstanceEvent,
    },
    TaskQueued {
        instance_id: Uuid,
        task_id: String,
        wait_id: String,
    },
    WorkflowCompleted {
        workflow_execution_id: String,
        status: ExecutionStatus,
    },
}

impl EngineEvent {
    /// Stable event name used for logging and subscriber filtering
    pub fn name(&self) -> &'static str {
        match self {
            Self::InstanceTransitioned { .. } => events::INSTANCE_TRANSITIONED,
            Self::TaskQueued { .. } => events::TASK_QUEUED,
            Self::WorkflowCompleted { .. } => events::WORKFLOW_COMPLETED,
        }
    }
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: EngineEvent,
    pub published_at: DateTime<Utc>,
}

/// Broadcast publisher for engine lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(PublishedEvent {
            event,
            published_at: Utc::now(),
        });
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
