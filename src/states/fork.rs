//! Parallel branches over a list of context elements, and their convergence.

use super::{ResponseMap, State};
use crate::config::{ConvergencePolicy, TimeoutConfig};
use crate::constants::FORK_TOKEN_SEPARATOR;
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{
    ChildInstanceBuilder, ContextElement, ElementExecutionSummary, ExecutionResponse,
    InstanceListElement, InstanceStatusSummary, StateExecutionData, StateType, WaitMode,
};
use crate::orchestration::ExecutionInterrupt;
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Elements a fork spawns one branch for
#[derive(Debug, Clone, PartialEq)]
pub enum ForkItems {
    Static(Vec<ContextElement>),
    /// One branch per host of the nearest instance list
    EachInstance,
}

impl ForkItems {
    fn resolve(&self, ctx: &ExecutionContext) -> StateResult<Vec<ContextElement>> {
        match self {
            Self::Static(items) => Ok(items.clone()),
            Self::EachInstance => Ok(ctx
                .instance_list()?
                .instances
                .iter()
                .map(|instance| {
                    ContextElement::InstanceList(InstanceListElement {
                        instances: vec![instance.clone()],
                    })
                })
                .collect()),
        }
    }
}

/// Combine branch statuses, given in delivery order
pub fn converge<I>(statuses: I, policy: ConvergencePolicy) -> ExecutionStatus
where
    I: IntoIterator<Item = ExecutionStatus>,
{
    let mut statuses = statuses.into_iter();
    match policy {
        ConvergencePolicy::FirstFailure => statuses
            .find(|status| *status != ExecutionStatus::Success)
            .unwrap_or(ExecutionStatus::Success),
        ConvergencePolicy::WorstOf => {
            statuses.fold(ExecutionStatus::Success, ExecutionStatus::worst_of)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForkBranch {
    token: String,
    branch_name: String,
    element: ContextElement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkState {
    name: String,
    state_type: StateType,
    child_state_machine_id: String,
    items: ForkItems,
    timeout: Duration,
    policy: Option<ConvergencePolicy>,
}

impl ForkState {
    pub fn new(
        name: impl Into<String>,
        child_state_machine_id: impl Into<String>,
        items: ForkItems,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            state_type: StateType::Fork,
            child_state_machine_id: child_state_machine_id.into(),
            items,
            timeout,
            policy: None,
        }
    }

    /// Resumes one execution per environment element, in parallel
    pub fn env_resume(
        name: impl Into<String>,
        child_state_machine_id: impl Into<String>,
        environments: Vec<ContextElement>,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self {
            state_type: StateType::EnvResume,
            ..Self::new(
                name,
                child_state_machine_id,
                ForkItems::Static(environments),
                timeouts.containment(),
            )
        }
    }

    /// Override the engine-wide convergence policy for this fork
    pub fn with_policy(mut self, policy: ConvergencePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn branch_token(&self, ctx: &ExecutionContext, index: usize) -> String {
        format!("{}{}{}", ctx.instance_id(), FORK_TOKEN_SEPARATOR, index)
    }
}

#[async_trait]
impl State for ForkState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        self.state_type
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn child_workflows(&self) -> Vec<String> {
        vec![self.child_state_machine_id.clone()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        let items = self.items.resolve(ctx)?;
        let mut data = StateExecutionData::new(&self.name, self.state_type);

        if items.is_empty() {
            info!(
                instance_id = %ctx.instance_id(),
                state = %self.name,
                "Nothing to fork"
            );
            data.status = ExecutionStatus::Success;
            data.ended_at = Some(Utc::now());
            return Ok(ExecutionResponse::success().with_execution_data(data));
        }

        let mut branches = Vec::with_capacity(items.len());
        let mut children = Vec::with_capacity(items.len());
        for (offset, element) in items.into_iter().enumerate() {
            let index = offset + 1;
            let token = self.branch_token(ctx, index);
            let branch_name = format!("{}_{}", self.name, index);
            children.push(
                ChildInstanceBuilder::from_template(ctx.instance())
                    .child_state_machine(&self.child_state_machine_id)
                    .display_name(&branch_name)
                    .identity_element(element.clone())
                    .context_transition(true)
                    .notify_id(&token),
            );
            branches.push(ForkBranch {
                token,
                branch_name,
                element,
            });
        }

        debug!(
            instance_id = %ctx.instance_id(),
            state = %self.name,
            branches = branches.len(),
            "Forking branches"
        );

        let tokens: Vec<String> = branches.iter().map(|branch| branch.token.clone()).collect();
        data.correlation_tokens = tokens.clone();
        data.payload = serde_json::to_value(&branches)?;

        Ok(ExecutionResponse::asynchronous(tokens, WaitMode::All)
            .with_execution_data(data)
            .with_spawned(children))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: &ResponseMap,
    ) -> StateResult<ExecutionResponse> {
        let mut data = ctx.execution_data().cloned().ok_or_else(|| {
            StateError::invariant(format!("Fork {} resumed without execution data", self.name))
        })?;
        let branches: Vec<ForkBranch> = data.payload_as()?;

        let mut delivered = Vec::with_capacity(responses.len());
        for received in responses.iter() {
            let completion = received.response.as_child_completion().ok_or_else(|| {
                StateError::invariant(format!(
                    "Token {} delivered a remote task response to a fork",
                    received.token
                ))
            })?;
            let branch = branches
                .iter()
                .find(|branch| branch.token == received.token)
                .ok_or_else(|| {
                    StateError::invariant(format!("Token {} is not a branch of {}", received.token, self.name))
                })?;
            delivered.push((branch, completion));
        }

        let policy = self
            .policy
            .unwrap_or(ctx.config().orchestrator.convergence_policy);
        let status = converge(delivered.iter().map(|(_, completion)| completion.status), policy);
        let error_message = delivered
            .iter()
            .find(|(_, completion)| completion.status == status && status != ExecutionStatus::Success)
            .map(|(branch, completion)| {
                format!(
                    "{}: {}",
                    branch.branch_name,
                    completion.error_message.as_deref().unwrap_or("branch did not succeed")
                )
            });

        let mut ordered = delivered.clone();
        ordered.sort_by_key(|(branch, _)| {
            branches
                .iter()
                .position(|candidate| candidate.token == branch.token)
        });
        data.element_status_summary = ordered
            .iter()
            .map(|(branch, completion)| ElementExecutionSummary {
                element: Some(branch.element.clone()),
                branch_name: branch.branch_name.clone(),
                status: completion.status,
                error_message: completion.error_message.clone(),
            })
            .collect();
        data.instance_status_summary = ordered
            .iter()
            .map(|(branch, completion)| InstanceStatusSummary {
                instance_id: completion.instance_id,
                state_name: completion.state_name.clone(),
                branch_name: branch.branch_name.clone(),
                status: completion.status,
            })
            .collect();
        data.status = status;
        data.error_msg = error_message.clone();
        data.ended_at = Some(Utc::now());

        info!(
            instance_id = %ctx.instance_id(),
            state = %self.name,
            status = %status,
            branches = ordered.len(),
            "Fork converged"
        );

        let notify_elements = ordered
            .iter()
            .flat_map(|(_, completion)| completion.notify_elements.iter().cloned())
            .collect();
        let mut response = ExecutionResponse::terminal(status)
            .with_execution_data(data)
            .with_notify_elements(notify_elements);
        if let Some(message) = error_message {
            response = response.with_error_message(message);
        }
        Ok(response)
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) {
        ctx.request_interrupt(ExecutionInterrupt::AbortChildren {
            parent_id: ctx.instance_id(),
        });
    }
}
