use super::context_element::ContextElement;
use crate::state_machine::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of work an executor performs for a remote task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AsgResize,
    ListenerUpdate,
    SteadyStateCheck,
    CommandExecution,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AsgResize => "asg_resize",
            Self::ListenerUpdate => "listener_update",
            Self::SteadyStateCheck => "steady_state_check",
            Self::CommandExecution => "command_execution",
        };
        write!(f, "{name}")
    }
}

/// Identifiers the executor pool uses to route a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskScope {
    pub account_id: String,
    pub app_id: String,
    pub env_id: Option<String>,
    pub infra_mapping_id: Option<String>,
}

/// Credentials resolved for a task. Passed opaquely to executors and never logged.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptionDetails {
    pub secret_ref: String,
    pub payload: Value,
}

impl fmt::Debug for EncryptionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionDetails")
            .field("secret_ref", &self.secret_ref)
            .field("payload", &"[REDACTED]")
            .finish()
    }
}

/// Unit of work handed to the external executor pool. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub task_id: String,
    pub task_type: TaskType,
    pub parameters: Value,
    pub scope: TaskScope,
    pub timeout_millis: u64,
    /// Correlation token the response will be delivered under
    pub wait_id: String,
    pub encryption_details: EncryptionDetails,
    pub created_at: DateTime<Utc>,
}

impl RemoteTask {
    pub fn new(
        task_type: TaskType,
        parameters: Value,
        scope: TaskScope,
        timeout_millis: u64,
        wait_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type,
            parameters,
            scope,
            timeout_millis,
            wait_id: wait_id.into(),
            encryption_details: EncryptionDetails::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_encryption_details(mut self, details: EncryptionDetails) -> Self {
        self.encryption_details = details;
        self
    }
}

/// Completion code reported by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failure,
    /// Recognized as retryable; the state may re-queue the request
    TransientFailure,
}

impl CompletionStatus {
    pub fn to_execution_status(self) -> ExecutionStatus {
        match self {
            Self::Success => ExecutionStatus::Success,
            Self::Failure | Self::TransientFailure => ExecutionStatus::Failed,
        }
    }
}

/// Response an executor delivers for a remote task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTaskResponse {
    pub status: CompletionStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RemoteTaskResponse {
    pub fn success(payload: Value) -> Self {
        Self {
            status: CompletionStatus::Success,
            error_message: None,
            payload,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Failure,
            error_message: Some(message.into()),
            payload: Value::Null,
        }
    }

    pub fn transient_failure(message: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::TransientFailure,
            error_message: Some(message.into()),
            payload: Value::Null,
        }
    }
}

/// Terminal report of a child branch, delivered to its parent's token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildCompletion {
    pub instance_id: Uuid,
    pub state_name: String,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub notify_elements: Vec<ContextElement>,
}

/// Anything that can be delivered to a correlation token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyResponse {
    RemoteTask(RemoteTaskResponse),
    ChildCompletion(ChildCompletion),
}

impl NotifyResponse {
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            Self::RemoteTask(response) => response.status.to_execution_status(),
            Self::ChildCompletion(completion) => completion.status,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::RemoteTask(response) => response.error_message.as_deref(),
            Self::ChildCompletion(completion) => completion.error_message.as_deref(),
        }
    }

    pub fn as_remote_task(&self) -> Option<&RemoteTaskResponse> {
        match self {
            Self::RemoteTask(response) => Some(response),
            Self::ChildCompletion(_) => None,
        }
    }

    pub fn as_child_completion(&self) -> Option<&ChildCompletion> {
        match self {
            Self::ChildCompletion(completion) => Some(completion),
            Self::RemoteTask(_) => None,
        }
    }
}

impl From<RemoteTaskResponse> for NotifyResponse {
    fn from(response: RemoteTaskResponse) -> Self {
        Self::RemoteTask(response)
    }
}

impl From<ChildCompletion> for NotifyResponse {
    fn from(completion: ChildCompletion) -> Self {
        Self::ChildCompletion(completion)
    }
}
