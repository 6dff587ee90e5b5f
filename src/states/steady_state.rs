use super::remote_call::{
    CallOutcome, DeploymentTarget, RemoteCallStrategy, RequestPlan, StrategyOutput, TaskRequest,
};
use super::resize::AsgCapacities;
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{ContainerServiceElement, ContextElement, StateType, TaskType};
use crate::state_machine::ExecutionStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SteadyStateTarget {
    cluster_name: String,
    service_name: String,
    desired_count: u32,
}

/// Polls a container service until its running count reaches the desired count.
///
/// The executor does the polling; the engine waits on a single token under the
/// long steady-state timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteadyStateStrategy {
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Default for SteadyStateStrategy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(25 * 60),
        }
    }
}

impl SteadyStateStrategy {
    pub fn new(poll_interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            poll_interval,
            poll_timeout,
        }
    }

    fn target(ctx: &ExecutionContext, target: &DeploymentTarget) -> StateResult<SteadyStateTarget> {
        let cluster_name = target.infrastructure.cluster_name.clone().ok_or_else(|| {
            StateError::configuration(format!(
                "Infrastructure mapping {} has no cluster name",
                target.infrastructure.id
            ))
        })?;
        let setup = ctx.service_setup()?;
        let desired_count = match AsgCapacities::from_context(ctx)? {
            Some(capacities) => capacities.new_group.desired,
            None => setup.desired_instances,
        };
        Ok(SteadyStateTarget {
            cluster_name,
            service_name: setup.new_group.name.clone(),
            desired_count,
        })
    }
}

impl RemoteCallStrategy for SteadyStateStrategy {
    fn state_type(&self) -> StateType {
        StateType::SteadyStateCheck
    }

    fn task_type(&self) -> TaskType {
        TaskType::SteadyStateCheck
    }

    fn command_name(&self) -> &str {
        "Wait For Steady State"
    }

    fn plan(&self, ctx: &ExecutionContext, target: &DeploymentTarget) -> StateResult<RequestPlan> {
        let steady = Self::target(ctx, target)?;
        let parameters = json!({
            "region": target.infrastructure.region,
            "provider": target.cloud_provider.provider,
            "cluster_name": steady.cluster_name,
            "service_name": steady.service_name,
            "desired_count": steady.desired_count,
            "poll_interval_ms": u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "poll_timeout_ms": u64::try_from(self.poll_timeout.as_millis()).unwrap_or(u64::MAX),
        });
        Ok(RequestPlan::single(
            TaskRequest::new(steady.service_name.clone(), parameters),
            serde_json::to_value(&steady)?,
        ))
    }

    fn on_responses(
        &self,
        _ctx: &ExecutionContext,
        outcome: &CallOutcome<'_>,
    ) -> StateResult<StrategyOutput> {
        if outcome.status != ExecutionStatus::Success {
            return Ok(StrategyOutput::default());
        }
        let steady: SteadyStateTarget = serde_json::from_value(outcome.strategy_data.clone())?;
        let running_count = outcome
            .requests
            .iter()
            .filter_map(|request| request.response.as_ref())
            .filter_map(|response| response.payload.get("running_count"))
            .filter_map(|count| count.as_u64())
            .last()
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(steady.desired_count);

        let service = ContextElement::ContainerService(ContainerServiceElement {
            service_name: steady.service_name,
            cluster_name: steady.cluster_name,
            desired_count: steady.desired_count,
            running_count,
        });
        Ok(StrategyOutput {
            context_elements: vec![service.clone()],
            notify_elements: vec![service],
            result: Some(json!({ "running_count": running_count })),
        })
    }
}
