//! Load balancer listener updates: weighted traffic shifts and blue/green swaps.

use super::remote_call::{
    CallOutcome, DeploymentTarget, RemoteCallStrategy, RequestPlan, StrategyOutput, TaskRequest,
};
use crate::constants::traffic::{MAX_WEIGHT, MIN_WEIGHT};
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{ContextElement, ListenerTarget, StateType, TaskType};
use crate::state_machine::ExecutionStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Param name the weight routed to the new target group is published under
pub const TRAFFIC_WEIGHT_PARAM: &str = "new_target_weight";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerAction {
    /// Route `new_weight` percent of traffic to the new target group
    ShiftTraffic { new_weight: u32 },
    /// Exchange the production and stage target groups
    Swap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerUpdateStrategy {
    action: ListenerAction,
    rollback: bool,
}

impl ListenerUpdateStrategy {
    pub fn new(action: ListenerAction) -> Self {
        Self {
            action,
            rollback: false,
        }
    }

    /// Drives traffic back to the old target group, or swaps the groups back
    pub fn rollback(action: ListenerAction) -> Self {
        Self {
            action,
            rollback: true,
        }
    }

    pub fn action(&self) -> ListenerAction {
        self.action
    }

    fn parameters(&self, listener: &ListenerTarget) -> StateResult<(Value, Option<u32>)> {
        match self.action {
            ListenerAction::ShiftTraffic { new_weight } => {
                if new_weight > MAX_WEIGHT {
                    return Err(StateError::configuration(format!(
                        "Traffic weight {new_weight} exceeds {MAX_WEIGHT}"
                    )));
                }
                let new_weight = if self.rollback { MIN_WEIGHT } else { new_weight };
                Ok((
                    json!({
                        "listener_id": listener.listener_id,
                        "new_target_group": listener.new_target_group,
                        "old_target_group": listener.old_target_group,
                        "new_weight": new_weight,
                        "old_weight": MAX_WEIGHT - new_weight,
                    }),
                    Some(new_weight),
                ))
            }
            ListenerAction::Swap => {
                let stage = listener
                    .stage_target_group
                    .as_deref()
                    .unwrap_or(&listener.new_target_group);
                let (production, standby) = if self.rollback {
                    (listener.old_target_group.as_str(), stage)
                } else {
                    (stage, listener.old_target_group.as_str())
                };
                Ok((
                    json!({
                        "listener_id": listener.listener_id,
                        "swap": true,
                        "production_target_group": production,
                        "stage_target_group": standby,
                    }),
                    None,
                ))
            }
        }
    }
}

impl RemoteCallStrategy for ListenerUpdateStrategy {
    fn state_type(&self) -> StateType {
        if self.rollback {
            StateType::ListenerUpdateRollback
        } else {
            StateType::ListenerUpdate
        }
    }

    fn task_type(&self) -> TaskType {
        TaskType::ListenerUpdate
    }

    fn command_name(&self) -> &str {
        match (self.action, self.rollback) {
            (ListenerAction::ShiftTraffic { .. }, false) => "Shift Traffic",
            (ListenerAction::ShiftTraffic { .. }, true) => "Rollback Traffic Shift",
            (ListenerAction::Swap, false) => "Swap Listeners",
            (ListenerAction::Swap, true) => "Rollback Listener Swap",
        }
    }

    fn plan(&self, ctx: &ExecutionContext, target: &DeploymentTarget) -> StateResult<RequestPlan> {
        let setup = ctx.service_setup()?;
        let listener = setup.listener.as_ref().ok_or_else(|| {
            StateError::configuration(format!(
                "No listener configured for {}",
                setup.new_group.name
            ))
        })?;

        let (mut parameters, weight) = self.parameters(listener)?;
        if let Some(object) = parameters.as_object_mut() {
            object.insert("region".to_string(), json!(target.infrastructure.region));
            object.insert("provider".to_string(), json!(target.cloud_provider.provider));
        }

        Ok(RequestPlan::single(
            TaskRequest::new(listener.listener_id.clone(), parameters),
            json!({ "new_weight": weight }),
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
        let weight = outcome.strategy_data.get("new_weight").cloned().unwrap_or(Value::Null);
        let mut output = StrategyOutput {
            result: Some(json!({ "new_weight": weight, "rollback": self.rollback })),
            ..StrategyOutput::default()
        };
        if !weight.is_null() {
            output
                .context_elements
                .push(ContextElement::param(TRAFFIC_WEIGHT_PARAM, weight));
        }
        Ok(output)
    }
}
