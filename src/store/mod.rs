//! # Instance Store
//!
//! Persistence for [`StateExecutionInstance`] records. The store is one of the two
//! pieces of shared mutable state in the engine (the correlation registry is the
//! other), and every status change goes through [`InstanceStore::transition`], a
//! compare-and-set on the current status. Instances are never deleted during a run.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::models::{
    ContextElement, PendingWait, ReceivedResponse, StateExecutionData, StateExecutionInstance,
};
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use in_memory::InMemoryInstanceStore;
#[cfg(feature = "postgres")]
pub use postgres::PgInstanceStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Instance {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Field changes applied together with a status transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub execution_data: Option<StateExecutionData>,
    pub append_context_elements: Vec<ContextElement>,
    pub notify_elements: Vec<ContextElement>,
    /// `Some(None)` clears the wait
    pub pending_wait: Option<Option<PendingWait>>,
    /// Recorded on the current wait, if there still is one
    pub received_responses: Vec<ReceivedResponse>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_data(mut self, data: Option<StateExecutionData>) -> Self {
        self.execution_data = data;
        self
    }

    pub fn with_context_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.append_context_elements = elements;
        self
    }

    pub fn with_notify_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.notify_elements = elements;
        self
    }

    pub fn with_pending_wait(mut self, wait: PendingWait) -> Self {
        self.pending_wait = Some(Some(wait));
        self
    }

    pub fn clear_pending_wait(mut self) -> Self {
        self.pending_wait = Some(None);
        self
    }

    pub fn with_received_responses(mut self, responses: Vec<ReceivedResponse>) -> Self {
        self.received_responses = responses;
        self
    }

    pub fn with_error_message(mut self, message: Option<String>) -> Self {
        self.error_message = message;
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn ended_now(mut self) -> Self {
        self.ended_at = Some(Utc::now());
        self
    }

    /// Apply to an in-memory record. Status is set by the caller.
    pub fn apply(self, instance: &mut StateExecutionInstance) {
        if let Some(data) = self.execution_data {
            instance.state_execution_data = Some(data);
        }
        instance
            .context_elements
            .extend(self.append_context_elements);
        instance.notify_elements.extend(self.notify_elements);
        if let Some(wait) = self.pending_wait {
            instance.pending_wait = wait;
        }
        if let Some(wait) = instance.pending_wait.as_mut() {
            wait.record(self.received_responses);
        }
        if self.error_message.is_some() {
            instance.error_message = self.error_message;
        }
        if self.started_at.is_some() {
            instance.started_at = self.started_at;
        }
        if self.ended_at.is_some() {
            instance.ended_at = self.ended_at;
        }
        instance.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert(&self, instance: StateExecutionInstance) -> StoreResult<()>;

    async fn get(&self, instance_id: Uuid) -> StoreResult<Option<StateExecutionInstance>>;

    /// Set status to `next` and apply `update` if the stored status is still
    /// `expected`. Returns `None` when the status no longer matches or the
    /// instance does not exist.
    async fn transition(
        &self,
        instance_id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        update: InstanceUpdate,
    ) -> StoreResult<Option<StateExecutionInstance>>;

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> StoreResult<Vec<StateExecutionInstance>>;

    /// Direct children of a container instance, in creation order
    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<StateExecutionInstance>>;

    async fn by_workflow_execution(
        &self,
        workflow_execution_id: &str,
    ) -> StoreResult<Vec<StateExecutionInstance>>;
}
