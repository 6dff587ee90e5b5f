use super::context_element::ContextElement;
use super::state_type::StateType;
use crate::state_machine::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Outcome of one forked element, recorded on the fork parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementExecutionSummary {
    pub element: Option<ContextElement>,
    pub branch_name: String,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

/// Status of one child instance, recorded on its container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatusSummary {
    pub instance_id: Uuid,
    pub state_name: String,
    pub branch_name: String,
    pub status: ExecutionStatus,
}

/// State-specific execution record persisted on the instance.
///
/// `payload` is owned by the state variant that wrote it; everything else is
/// common bookkeeping the orchestrator and summaries read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionData {
    pub state_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    pub activity_id: Option<String>,
    pub error_msg: Option<String>,
    #[serde(default)]
    pub correlation_tokens: Vec<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub element_status_summary: Vec<ElementExecutionSummary>,
    #[serde(default)]
    pub instance_status_summary: Vec<InstanceStatusSummary>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StateExecutionData {
    pub fn new(state_name: impl Into<String>, state_type: StateType) -> Self {
        Self {
            state_name: state_name.into(),
            state_type,
            status: ExecutionStatus::Running,
            activity_id: None,
            error_msg: None,
            correlation_tokens: Vec::new(),
            task_ids: Vec::new(),
            payload: Value::Null,
            element_status_summary: Vec::new(),
            instance_status_summary: Vec::new(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Decode the variant-specific payload
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
