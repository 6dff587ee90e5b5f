//! # Remote Call State
//!
//! The dispatch-and-resume algorithm shared by every state that acts through the
//! executor pool.
//!
//! `execute` resolves the deployment target (infrastructure mapping, cloud provider
//! settings, encryption details), lets the strategy build one or more requests,
//! opens an activity, queues one [`RemoteTask`] per request under a fresh
//! correlation token and suspends on all of them.
//!
//! `handle_async_response` records each response against its request. Requests
//! that failed transiently are re-queued under new tokens while the attempt budget
//! lasts, suspending again. Otherwise the worst status across requests becomes the
//! result, the strategy contributes elements, the activity is closed and, for
//! rollback-once states, the workflow-wide marker is saved on success.

use super::rollback::RollbackOnce;
use super::{ResponseMap, State};
use crate::config::TimeoutConfig;
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{
    CompletionStatus, ContextElement, EncryptionDetails, ExecutionResponse, PhaseElement,
    RemoteTask, RemoteTaskResponse, StateExecutionData, StateType, TaskScope, TaskType, WaitMode,
};
use crate::services::{CloudProviderConfig, InfrastructureMapping, NewActivity};
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where and with which credentials a remote call runs
#[derive(Debug, Clone)]
pub struct DeploymentTarget {
    pub phase: PhaseElement,
    pub infrastructure: InfrastructureMapping,
    pub cloud_provider: CloudProviderConfig,
    pub encryption_details: EncryptionDetails,
}

impl DeploymentTarget {
    pub async fn resolve(ctx: &ExecutionContext) -> StateResult<Self> {
        let phase = ctx.phase()?.clone();
        let services = ctx.services();
        let infrastructure = services
            .infrastructure
            .get(ctx.app_id(), &phase.infra_mapping_id)
            .await?;
        let cloud_provider = services
            .settings
            .get(&infrastructure.compute_provider_setting_id)
            .await?;
        let encryption_details = services
            .secrets
            .get_encryption_details(&cloud_provider, ctx.app_id(), ctx.workflow_execution_id())
            .await?;

        Ok(Self {
            phase,
            infrastructure,
            cloud_provider,
            encryption_details,
        })
    }

    pub fn scope(&self, ctx: &ExecutionContext) -> TaskScope {
        TaskScope {
            account_id: ctx.account_id().to_string(),
            app_id: ctx.app_id().to_string(),
            env_id: Some(self.infrastructure.env_id.clone()),
            infra_mapping_id: Some(self.infrastructure.id.clone()),
        }
    }
}

/// One unit of remote work a strategy asks for
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub label: String,
    pub parameters: Value,
}

impl TaskRequest {
    pub fn new(label: impl Into<String>, parameters: Value) -> Self {
        Self {
            label: label.into(),
            parameters,
        }
    }
}

/// Requests plus strategy-private data kept until the responses arrive
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestPlan {
    pub requests: Vec<TaskRequest>,
    pub data: Value,
}

impl RequestPlan {
    pub fn single(request: TaskRequest, data: Value) -> Self {
        Self {
            requests: vec![request],
            data,
        }
    }
}

/// A dispatched request and, once delivered, its response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub label: String,
    pub parameters: Value,
    pub token: String,
    pub task_id: String,
    pub attempts: u32,
    pub response: Option<RemoteTaskResponse>,
}

impl RequestOutcome {
    pub fn status(&self) -> Option<ExecutionStatus> {
        self.response
            .as_ref()
            .map(|response| response.status.to_execution_status())
    }

    fn is_transient_failure(&self) -> bool {
        matches!(
            self.response.as_ref().map(|response| response.status),
            Some(CompletionStatus::TransientFailure)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteCallRecord {
    command_name: String,
    requests: Vec<RequestOutcome>,
    #[serde(default)]
    strategy_data: Value,
    #[serde(default)]
    result: Value,
}

/// Everything the strategy sees when the calls have finished
#[derive(Debug)]
pub struct CallOutcome<'a> {
    pub status: ExecutionStatus,
    pub error_message: Option<&'a str>,
    pub requests: &'a [RequestOutcome],
    pub strategy_data: &'a Value,
}

/// Elements and result a strategy contributes on completion
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub context_elements: Vec<ContextElement>,
    pub notify_elements: Vec<ContextElement>,
    pub result: Option<Value>,
}

/// Variant-specific half of a remote-call state
pub trait RemoteCallStrategy: Send + Sync {
    fn state_type(&self) -> StateType;

    fn task_type(&self) -> TaskType;

    fn command_name(&self) -> &str;

    /// Build the requests to dispatch. An empty plan completes the state with SUCCESS.
    fn plan(&self, ctx: &ExecutionContext, target: &DeploymentTarget) -> StateResult<RequestPlan>;

    fn on_responses(
        &self,
        _ctx: &ExecutionContext,
        _outcome: &CallOutcome<'_>,
    ) -> StateResult<StrategyOutput> {
        Ok(StrategyOutput::default())
    }
}

pub struct RemoteCallState {
    name: String,
    timeout: Duration,
    disabled: bool,
    rollback_once: Option<RollbackOnce>,
    max_transient_requeues: Option<u32>,
    strategy: Box<dyn RemoteCallStrategy>,
}

impl std::fmt::Debug for RemoteCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallState")
            .field("name", &self.name)
            .field("state_type", &self.strategy.state_type())
            .field("timeout", &self.timeout)
            .field("disabled", &self.disabled)
            .field("rollback_once", &self.rollback_once)
            .finish()
    }
}

impl RemoteCallState {
    pub fn new(
        name: impl Into<String>,
        strategy: impl RemoteCallStrategy + 'static,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            timeout,
            disabled: false,
            rollback_once: None,
            max_transient_requeues: None,
            strategy: Box::new(strategy),
        }
    }

    /// Timeout picked from the configured defaults for the strategy's task type
    pub fn with_default_timeout(
        name: impl Into<String>,
        strategy: impl RemoteCallStrategy + 'static,
        timeouts: &TimeoutConfig,
    ) -> Self {
        let timeout = match strategy.task_type() {
            TaskType::SteadyStateCheck => timeouts.steady_state(),
            _ => timeouts.leaf(),
        };
        Self::new(name, strategy, timeout)
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn rollback_once(mut self, guard: RollbackOnce) -> Self {
        self.rollback_once = Some(guard);
        self
    }

    /// Override the engine-wide transient requeue budget for this state
    pub fn max_transient_requeues(mut self, limit: u32) -> Self {
        self.max_transient_requeues = Some(limit);
        self
    }

    pub fn strategy(&self) -> &dyn RemoteCallStrategy {
        self.strategy.as_ref()
    }

    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        target: &DeploymentTarget,
        label: String,
        parameters: Value,
        attempts: u32,
    ) -> StateResult<RequestOutcome> {
        let token = Uuid::new_v4().to_string();
        let timeout_millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let task = RemoteTask::new(
            self.strategy.task_type(),
            parameters.clone(),
            target.scope(ctx),
            timeout_millis,
            token.clone(),
        )
        .with_encryption_details(target.encryption_details.clone());

        let task_id = ctx.services().dispatcher.queue(task).await?;

        debug!(
            instance_id = %ctx.instance_id(),
            state = %self.name,
            task_type = %self.strategy.task_type(),
            task_id = %task_id,
            token = %token,
            attempt = attempts,
            "Queued remote task"
        );

        Ok(RequestOutcome {
            label,
            parameters,
            token,
            task_id,
            attempts,
            response: None,
        })
    }

    async fn open_activity(
        &self,
        ctx: &ExecutionContext,
        target: &DeploymentTarget,
    ) -> StateResult<String> {
        let activity = NewActivity {
            app_id: ctx.app_id().to_string(),
            env_id: Some(target.infrastructure.env_id.clone()),
            workflow_execution_id: ctx.workflow_execution_id().to_string(),
            state_name: self.name.clone(),
            command_name: self.strategy.command_name().to_string(),
            command_type: self.strategy.state_type().to_string(),
        };
        Ok(ctx.services().activities.create(activity).await?)
    }

    /// Activity updates never fail the state
    async fn close_activity(
        &self,
        ctx: &ExecutionContext,
        activity_id: Option<&str>,
        status: ExecutionStatus,
    ) {
        let Some(activity_id) = activity_id else {
            return;
        };
        if let Err(err) = ctx
            .services()
            .activities
            .update_status(activity_id, status)
            .await
        {
            warn!(
                instance_id = %ctx.instance_id(),
                activity_id = %activity_id,
                error = %err,
                "Failed to update activity status"
            );
        }
    }

    fn requeue_limit(&self, ctx: &ExecutionContext) -> u32 {
        self.max_transient_requeues
            .unwrap_or(ctx.config().orchestrator.max_transient_requeues)
    }
}

#[async_trait]
impl State for RemoteCallState {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_type(&self) -> StateType {
        self.strategy.state_type()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn skip_reason(&self, _ctx: &ExecutionContext) -> Option<String> {
        self.disabled
            .then(|| format!("{} is disabled", self.name))
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse> {
        let mut data = StateExecutionData::new(&self.name, self.state_type());

        if let Some(guard) = &self.rollback_once {
            if guard.is_completed(ctx).await? {
                info!(
                    instance_id = %ctx.instance_id(),
                    state = %self.name,
                    marker = guard.marker(),
                    "Rollback already completed for this workflow execution"
                );
                data.status = ExecutionStatus::Success;
                data.ended_at = Some(Utc::now());
                data.payload = json!({ "short_circuited_by": guard.marker() });
                return Ok(ExecutionResponse::success().with_execution_data(data));
            }
        }

        let target = DeploymentTarget::resolve(ctx).await?;
        let plan = self.strategy.plan(ctx, &target)?;

        if plan.requests.is_empty() {
            data.status = ExecutionStatus::Success;
            data.ended_at = Some(Utc::now());
            data.payload = json!({ "strategy_data": plan.data });
            return Ok(ExecutionResponse::success().with_execution_data(data));
        }

        let activity_id = self.open_activity(ctx, &target).await?;
        data.activity_id = Some(activity_id.clone());

        let mut requests = Vec::with_capacity(plan.requests.len());
        for request in plan.requests {
            match self
                .dispatch(ctx, &target, request.label, request.parameters, 1)
                .await
            {
                Ok(outcome) => requests.push(outcome),
                Err(err) => {
                    self.close_activity(ctx, Some(&activity_id), err.terminal_status())
                        .await;
                    return Err(err);
                }
            }
        }

        let tokens: Vec<String> = requests.iter().map(|r| r.token.clone()).collect();
        data.correlation_tokens = tokens.clone();
        data.task_ids = requests.iter().map(|r| r.task_id.clone()).collect();
        data.payload = serde_json::to_value(RemoteCallRecord {
            command_name: self.strategy.command_name().to_string(),
            requests,
            strategy_data: plan.data,
            result: Value::Null,
        })?;

        Ok(ExecutionResponse::asynchronous(tokens, WaitMode::All).with_execution_data(data))
    }

    async fn handle_async_response(
        &self,
        ctx: &ExecutionContext,
        responses: &ResponseMap,
    ) -> StateResult<ExecutionResponse> {
        let mut data = ctx
            .execution_data()
            .cloned()
            .ok_or_else(|| StateError::invariant(format!("{} resumed without execution data", self.name)))?;
        let mut record: RemoteCallRecord = data.payload_as()?;

        for received in responses.iter() {
            let response = received.response.as_remote_task().ok_or_else(|| {
                StateError::invariant(format!(
                    "Token {} delivered a child completion to a remote call",
                    received.token
                ))
            })?;
            let request = record
                .requests
                .iter_mut()
                .find(|request| request.token == received.token)
                .ok_or_else(|| {
                    StateError::invariant(format!("Token {} was never dispatched", received.token))
                })?;
            request.response = Some(response.clone());
        }

        let limit = self.requeue_limit(ctx);
        let retryable: Vec<usize> = record
            .requests
            .iter()
            .enumerate()
            .filter(|(_, request)| request.is_transient_failure() && request.attempts <= limit)
            .map(|(index, _)| index)
            .collect();

        if !retryable.is_empty() {
            let target = DeploymentTarget::resolve(ctx).await?;
            let mut tokens = Vec::with_capacity(retryable.len());
            for index in retryable {
                let previous = record.requests[index].clone();
                warn!(
                    instance_id = %ctx.instance_id(),
                    state = %self.name,
                    request = %previous.label,
                    attempt = previous.attempts,
                    error = previous.response.as_ref().and_then(|r| r.error_message.as_deref()).unwrap_or("-"),
                    "Re-queueing request after transient failure"
                );
                let requeued = match self
                    .dispatch(ctx, &target, previous.label, previous.parameters, previous.attempts + 1)
                    .await
                {
                    Ok(requeued) => requeued,
                    Err(err) => {
                        self.close_activity(ctx, data.activity_id.as_deref(), err.terminal_status())
                            .await;
                        return Err(err);
                    }
                };
                tokens.push(requeued.token.clone());
                data.task_ids.push(requeued.task_id.clone());
                record.requests[index] = requeued;
            }
            data.correlation_tokens = tokens.clone();
            data.payload = serde_json::to_value(&record)?;
            return Ok(ExecutionResponse::asynchronous(tokens, WaitMode::All).with_execution_data(data));
        }

        let mut status = ExecutionStatus::Success;
        let mut failures = Vec::new();
        for request in &record.requests {
            let request_status = request.status().ok_or_else(|| {
                StateError::invariant(format!("Request {} resumed without a response", request.label))
            })?;
            status = status.worst_of(request_status);
            if !request_status.is_successful() {
                let message = request
                    .response
                    .as_ref()
                    .and_then(|response| response.error_message.as_deref())
                    .unwrap_or("remote task failed");
                failures.push(format!("{}: {}", request.label, message));
            }
        }
        let error_message = (!failures.is_empty()).then(|| failures.join("; "));

        let output = self.strategy.on_responses(
            ctx,
            &CallOutcome {
                status,
                error_message: error_message.as_deref(),
                requests: &record.requests,
                strategy_data: &record.strategy_data,
            },
        );
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.close_activity(ctx, data.activity_id.as_deref(), err.terminal_status())
                    .await;
                return Err(err);
            }
        };

        self.close_activity(ctx, data.activity_id.as_deref(), status)
            .await;

        if status == ExecutionStatus::Success {
            if let Some(guard) = &self.rollback_once {
                guard.mark_completed(ctx).await?;
            }
        }

        info!(
            instance_id = %ctx.instance_id(),
            state = %self.name,
            status = %status,
            requests = record.requests.len(),
            "Remote call completed"
        );

        if let Some(result) = output.result {
            record.result = result;
        }
        data.status = status;
        data.error_msg = error_message.clone();
        data.ended_at = Some(Utc::now());
        data.payload = serde_json::to_value(&record)?;

        let mut response = ExecutionResponse::terminal(status)
            .with_execution_data(data)
            .with_notify_elements(output.notify_elements);
        response.context_elements = output.context_elements;
        if let Some(message) = error_message {
            response = response.with_error_message(message);
        }
        Ok(response)
    }

    async fn handle_abort_event(&self, ctx: &ExecutionContext) {
        let activity_id = ctx
            .execution_data()
            .and_then(|data| data.activity_id.clone());
        self.close_activity(ctx, activity_id.as_deref(), ExecutionStatus::Failed)
            .await;
    }
}
