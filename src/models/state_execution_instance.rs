use super::context_element::ContextElement;
use super::execution_data::StateExecutionData;
use super::remote_task::NotifyResponse;
use super::state_type::StateType;
use crate::state_machine::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How many tokens of a wait must be delivered before the instance resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    #[default]
    All,
    Any,
}

/// A response delivered to a correlation token, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedResponse {
    pub token: String,
    pub response: NotifyResponse,
    pub received_at: DateTime<Utc>,
}

/// Wait registered by a suspended instance, persisted so it can be re-armed after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWait {
    pub tokens: Vec<String>,
    pub mode: WaitMode,
    pub deadline: DateTime<Utc>,
    /// Responses delivered before the wait was satisfied
    #[serde(default)]
    pub received: Vec<ReceivedResponse>,
}

impl PendingWait {
    pub fn new(tokens: Vec<String>, mode: WaitMode, deadline: DateTime<Utc>) -> Self {
        Self {
            tokens,
            mode,
            deadline,
            received: Vec::new(),
        }
    }

    /// Record responses not seen yet; a token already recorded keeps its first response
    pub fn record(&mut self, responses: impl IntoIterator<Item = ReceivedResponse>) {
        for received in responses {
            if self.tokens.contains(&received.token)
                && !self.received.iter().any(|seen| seen.token == received.token)
            {
                self.received.push(received);
            }
        }
        self.received.sort_by_key(|received| received.received_at);
    }
}

/// One execution attempt of one workflow graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionInstance {
    pub id: Uuid,
    pub display_name: String,
    pub state_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    pub workflow_execution_id: String,
    pub app_id: String,
    pub account_id: String,
    /// Workflow definition the execution was started from
    pub state_machine_id: String,
    /// Nested definition this instance runs in, when it belongs to a sub-workflow or fork branch
    pub child_state_machine_id: Option<String>,
    pub parent_instance_id: Option<Uuid>,
    pub prev_instance_id: Option<Uuid>,
    /// Token delivered to when this instance's branch completes
    pub notify_id: Option<String>,
    pub state_execution_data: Option<StateExecutionData>,
    /// Elements visible to this instance and its successors, oldest first
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
    /// Elements handed to the parent when the branch completes
    #[serde(default)]
    pub notify_elements: Vec<ContextElement>,
    /// Identity element of a forked branch
    pub context_element: Option<ContextElement>,
    /// Whether the instance resulted from looping or forking
    #[serde(default)]
    pub context_transition: bool,
    pub pending_wait: Option<PendingWait>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StateExecutionInstance {
    /// Create the first instance of a workflow execution
    pub fn new(
        workflow_execution_id: impl Into<String>,
        app_id: impl Into<String>,
        account_id: impl Into<String>,
        state_machine_id: impl Into<String>,
        state_name: impl Into<String>,
        state_type: StateType,
    ) -> Self {
        let now = Utc::now();
        let state_name = state_name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: state_name.clone(),
            state_name,
            state_type,
            status: ExecutionStatus::New,
            workflow_execution_id: workflow_execution_id.into(),
            app_id: app_id.into(),
            account_id: account_id.into(),
            state_machine_id: state_machine_id.into(),
            child_state_machine_id: None,
            parent_instance_id: None,
            prev_instance_id: None,
            notify_id: None,
            state_execution_data: None,
            context_elements: Vec::new(),
            notify_elements: Vec::new(),
            context_element: None,
            context_transition: false,
            pending_wait: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_context_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.context_elements = elements;
        self
    }

    /// Definition whose graph this instance is a node of
    pub fn graph_id(&self) -> &str {
        self.child_state_machine_id
            .as_deref()
            .unwrap_or(&self.state_machine_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Elements this instance contributes to the visible set, nearest first
    pub fn visible_elements(&self) -> impl Iterator<Item = &ContextElement> {
        self.context_element
            .iter()
            .chain(self.context_elements.iter().rev())
    }
}

/// Builds a fresh child record from a parent instance.
///
/// Only the execution envelope is copied. Status, timestamps, execution data, wait
/// and element stacks start empty; the child sees the parent's elements through its
/// ancestor chain instead.
#[derive(Debug, Clone)]
pub struct ChildInstanceBuilder {
    parent_instance_id: Uuid,
    workflow_execution_id: String,
    app_id: String,
    account_id: String,
    state_machine_id: String,
    child_state_machine_id: Option<String>,
    display_name: Option<String>,
    state_name: Option<String>,
    notify_id: Option<String>,
    context_element: Option<ContextElement>,
    context_transition: bool,
}

impl ChildInstanceBuilder {
    pub fn from_template(parent: &StateExecutionInstance) -> Self {
        Self {
            parent_instance_id: parent.id,
            workflow_execution_id: parent.workflow_execution_id.clone(),
            app_id: parent.app_id.clone(),
            account_id: parent.account_id.clone(),
            state_machine_id: parent.state_machine_id.clone(),
            child_state_machine_id: parent.child_state_machine_id.clone(),
            display_name: None,
            state_name: None,
            notify_id: Some(parent.id.to_string()),
            context_element: None,
            context_transition: false,
        }
    }

    pub fn child_state_machine(mut self, state_machine_id: impl Into<String>) -> Self {
        self.child_state_machine_id = Some(state_machine_id.into());
        self
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Start the child at a named state instead of the graph's initial state
    pub fn state_name(mut self, state_name: impl Into<String>) -> Self {
        self.state_name = Some(state_name.into());
        self
    }

    pub fn notify_id(mut self, notify_id: impl Into<String>) -> Self {
        self.notify_id = Some(notify_id.into());
        self
    }

    pub fn identity_element(mut self, element: ContextElement) -> Self {
        self.context_element = Some(element);
        self
    }

    pub fn context_transition(mut self, forked: bool) -> Self {
        self.context_transition = forked;
        self
    }

    pub fn parent_instance_id(&self) -> Uuid {
        self.parent_instance_id
    }

    /// Definition the child will run in
    pub fn graph_id(&self) -> &str {
        self.child_state_machine_id
            .as_deref()
            .unwrap_or(&self.state_machine_id)
    }

    pub fn requested_state(&self) -> Option<&str> {
        self.state_name.as_deref()
    }

    pub fn notify(&self) -> Option<&str> {
        self.notify_id.as_deref()
    }

    pub fn build(self, state_name: &str, state_type: StateType) -> StateExecutionInstance {
        let now = Utc::now();
        let state_name = self.state_name.unwrap_or_else(|| state_name.to_string());
        StateExecutionInstance {
            id: Uuid::new_v4(),
            display_name: self.display_name.unwrap_or_else(|| state_name.clone()),
            state_name,
            state_type,
            status: ExecutionStatus::New,
            workflow_execution_id: self.workflow_execution_id,
            app_id: self.app_id,
            account_id: self.account_id,
            state_machine_id: self.state_machine_id,
            child_state_machine_id: self.child_state_machine_id,
            parent_instance_id: Some(self.parent_instance_id),
            prev_instance_id: None,
            notify_id: self.notify_id,
            state_execution_data: None,
            context_elements: Vec::new(),
            notify_elements: Vec::new(),
            context_element: self.context_element,
            context_transition: self.context_transition,
            pending_wait: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Builds the instance for the next node on a success or failure edge
#[derive(Debug, Clone)]
pub struct SuccessorBuilder<'a> {
    previous: &'a StateExecutionInstance,
}

impl<'a> SuccessorBuilder<'a> {
    pub fn from_completed(previous: &'a StateExecutionInstance) -> Self {
        Self { previous }
    }

    pub fn build(self, state_name: &str, state_type: StateType) -> StateExecutionInstance {
        let previous = self.previous;
        let now = Utc::now();
        StateExecutionInstance {
            id: Uuid::new_v4(),
            display_name: state_name.to_string(),
            state_name: state_name.to_string(),
            state_type,
            status: ExecutionStatus::New,
            workflow_execution_id: previous.workflow_execution_id.clone(),
            app_id: previous.app_id.clone(),
            account_id: previous.account_id.clone(),
            state_machine_id: previous.state_machine_id.clone(),
            child_state_machine_id: previous.child_state_machine_id.clone(),
            parent_instance_id: previous.parent_instance_id,
            prev_instance_id: Some(previous.id),
            notify_id: previous.notify_id.clone(),
            state_execution_data: None,
            context_elements: previous.context_elements.clone(),
            notify_elements: previous.notify_elements.clone(),
            context_element: previous.context_element.clone(),
            context_transition: previous.context_transition,
            pending_wait: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }
}
