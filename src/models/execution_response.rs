use super::context_element::ContextElement;
use super::execution_data::StateExecutionData;
use super::state_execution_instance::{ChildInstanceBuilder, WaitMode};
use crate::state_machine::ExecutionStatus;

/// What a state returns from `execute` or `handle_async_response`.
///
/// A terminal response carries the final status. An asynchronous one carries the
/// correlation tokens the instance suspends on and, for container states, the
/// children to trigger.
#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub is_async: bool,
    pub correlation_ids: Vec<String>,
    pub wait_mode: WaitMode,
    pub error_message: Option<String>,
    pub state_execution_data: Option<StateExecutionData>,
    /// Pushed on this instance, visible to successors and descendants
    pub context_elements: Vec<ContextElement>,
    /// Handed to the parent when the branch completes
    pub notify_elements: Vec<ContextElement>,
    pub spawn: Vec<ChildInstanceBuilder>,
}

impl ExecutionResponse {
    pub fn terminal(status: ExecutionStatus) -> Self {
        Self {
            status,
            is_async: false,
            correlation_ids: Vec::new(),
            wait_mode: WaitMode::All,
            error_message: None,
            state_execution_data: None,
            context_elements: Vec::new(),
            notify_elements: Vec::new(),
            spawn: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::terminal(ExecutionStatus::Success)
    }

    pub fn asynchronous(correlation_ids: Vec<String>, wait_mode: WaitMode) -> Self {
        Self {
            is_async: true,
            correlation_ids,
            wait_mode,
            ..Self::terminal(ExecutionStatus::Running)
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_execution_data(mut self, data: StateExecutionData) -> Self {
        self.state_execution_data = Some(data);
        self
    }

    pub fn with_context_element(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }

    pub fn with_notify_elements(mut self, elements: Vec<ContextElement>) -> Self {
        self.notify_elements.extend(elements);
        self
    }

    pub fn with_spawned(mut self, children: Vec<ChildInstanceBuilder>) -> Self {
        self.spawn.extend(children);
        self
    }
}
