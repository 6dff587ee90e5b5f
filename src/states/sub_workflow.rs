use super::{ResponseMap, State};
use crate::config::TimeoutConfig;
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{
    ChildInstanceBuilder, ExecutionResponse, InstanceStatusSummary, StateExecutionData, StateType,
    WaitMode,
};
use crate::orchestration::ExecutionInterrupt;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// Runs a nested workflow definition as a single child branch and takes its
/// terminal status. The child notifies on the parent's own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubWorkflowState {
    name: String,
    child_state_machine_id: String,
    timeout: Duration,
}

impl SubWorkflowState {
    pub fn new(
        name: impl Into<String>,
        child_state_machine_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            child_state_machine_id: child_state_machine_id.into(),
            timeout,
        }
    }

    pub fn with_default_timeout(
        name: impl Into<String>,
        child_state_machine_id: impl Into<String>,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self::new(name, child_state_machine_id, timeouts.containment())
    }

    pub fn child_state_machine_id(&self) -> &str {
        &self.child_state_machine_id
    }
}

#[async_trait]
impl State for SubWorkflowState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        StateType::SubWorkflow
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn child_workflows(&self) -> Vec<String> {
        vec![self.child_state_machine_id.clone()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        let token = ctx.instance_id().to_string();
        let child = ChildInstanceBuilder::from_template(ctx.instance())
            .child_state_machine(&self.child_state_machine_id)
            .notify_id(&token);

        debug!(
            instance_id = %ctx.instance_id(),
            state = %self.name,
            child_workflow = %self.child_state_machine_id,
            "Spawning sub-workflow"
        );

        let mut data = StateExecutionData::new(&self.name, StateType::SubWorkflow);
        data.correlation_tokens = vec![token.clone()];

        Ok(ExecutionResponse::asynchronous(vec![token], WaitMode::All)
            .with_execution_data(data)
            .with_spawned(vec![child]))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: &ResponseMap,
    ) -> StateResult<ExecutionResponse> {
        let token = ctx.instance_id().to_string();
        let completion = responses
            .get(&token)
            .and_then(|response| response.as_child_completion())
            .ok_or_else(|| {
                StateError::invariant(format!(
                    "Sub-workflow {} resumed without its child completion",
                    self.name
                ))
            })?;

        let mut data = ctx
            .execution_data()
            .cloned()
            .unwrap_or_else(|| StateExecutionData::new(&self.name, StateType::SubWorkflow));
        data.status = completion.status;
        data.error_msg = completion.error_message.clone();
        data.ended_at = Some(Utc::now());
        data.instance_status_summary = vec![InstanceStatusSummary {
            instance_id: completion.instance_id,
            state_name: completion.state_name.clone(),
            branch_name: self.child_state_machine_id.clone(),
            status: completion.status,
        }];

        let mut response = ExecutionResponse::terminal(completion.status)
            .with_execution_data(data)
            .with_notify_elements(completion.notify_elements.clone());
        response.context_elements = completion.notify_elements.clone();
        if let Some(message) = &completion.error_message {
            response = response.with_error_message(message.clone());
        }
        Ok(response)
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) {
        ctx.request_interrupt(ExecutionInterrupt::AbortChildren {
            parent_id: ctx.instance_id(),
        });
    }
}
