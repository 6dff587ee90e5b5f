//! Auto scaling group resize, forward and rollback.
//!
//! Forward: the new group grows to the requested total and old groups shrink by the
//! number of instances added, first old group drained first. Blue/green setups keep
//! old groups at capacity. Rollback restores the capacities recorded by the setup
//! step, walking old groups in reverse.
//!
//! Capacities after each resize are published as the `asg_capacities` param so a
//! later resize in the same phase starts from them instead of from the setup.

use super::remote_call::{
    CallOutcome, DeploymentTarget, RemoteCallStrategy, RequestPlan, StrategyOutput, TaskRequest,
};
use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult};
use crate::models::{
    ContextElement, GroupCapacity, InstanceElement, InstanceListElement, ServiceSetupElement,
    StateType, TaskType,
};
use crate::state_machine::ExecutionStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Param name the post-resize capacities are published under
pub const CAPACITY_PARAM: &str = "asg_capacities";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceUnitType {
    #[default]
    Count,
    Percentage,
}

/// Capacities of the groups a deployment touches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsgCapacities {
    pub new_group: GroupCapacity,
    pub old_groups: Vec<GroupCapacity>,
}

impl AsgCapacities {
    /// Capacities published by an earlier resize, if any are visible
    pub fn from_context(ctx: &ExecutionContext) -> StateResult<Option<Self>> {
        ctx.param(CAPACITY_PARAM).map(Self::from_param).transpose()
    }

    fn from_param(value: &serde_json::Value) -> StateResult<Self> {
        serde_json::from_value(value.clone()).map_err(|err| {
            StateError::configuration(format!("Param {CAPACITY_PARAM} is malformed: {err}"))
        })
    }

    fn from_setup(setup: &ServiceSetupElement) -> Self {
        Self {
            new_group: setup.new_group.clone(),
            old_groups: setup.old_groups.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResizePlan {
    instances_to_add: u32,
    capacities: AsgCapacities,
    resize_new_first: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeAsgStrategy {
    instance_count: u32,
    unit: InstanceUnitType,
    rollback: bool,
}

impl ResizeAsgStrategy {
    pub fn new(instance_count: u32, unit: InstanceUnitType) -> Self {
        Self {
            instance_count,
            unit,
            rollback: false,
        }
    }

    /// Restores the capacities recorded before the deployment
    pub fn rollback() -> Self {
        Self {
            instance_count: 0,
            unit: InstanceUnitType::Count,
            rollback: true,
        }
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback
    }

    /// Instances the new group should end with. Percentages are capped at 100,
    /// rounded, and never below one instance.
    pub fn total_instances(&self, max_instances: u32) -> u32 {
        match self.unit {
            InstanceUnitType::Count => self.instance_count,
            InstanceUnitType::Percentage => {
                let percent = f64::from(self.instance_count.min(100));
                let total = (percent * f64::from(max_instances) / 100.0).round() as u32;
                total.max(1)
            }
        }
    }

    fn plan_forward(&self, setup: &ServiceSetupElement, current: &AsgCapacities) -> ResizePlan {
        let total = self.total_instances(setup.desired_instances);
        let instances_to_add = total.saturating_sub(current.new_group.desired);

        let old_groups = if setup.blue_green {
            current.old_groups.clone()
        } else {
            let mut remaining = instances_to_add;
            current
                .old_groups
                .iter()
                .map(|group| {
                    let removed = remaining.min(group.desired);
                    remaining -= removed;
                    GroupCapacity {
                        name: group.name.clone(),
                        desired: group.desired - removed,
                    }
                })
                .collect()
        };

        ResizePlan {
            instances_to_add,
            capacities: AsgCapacities {
                new_group: GroupCapacity {
                    name: current.new_group.name.clone(),
                    desired: current.new_group.desired + instances_to_add,
                },
                old_groups,
            },
            resize_new_first: setup.resize_new_first,
        }
    }

    fn plan_rollback(setup: &ServiceSetupElement) -> ResizePlan {
        let mut capacities = AsgCapacities::from_setup(setup);
        capacities.old_groups.reverse();
        ResizePlan {
            instances_to_add: 0,
            capacities,
            resize_new_first: !setup.resize_new_first,
        }
    }
}

impl RemoteCallStrategy for ResizeAsgStrategy {
    fn state_type(&self) -> StateType {
        if self.rollback {
            StateType::ResizeAsgRollback
        } else {
            StateType::ResizeAsg
        }
    }

    fn task_type(&self) -> TaskType {
        TaskType::AsgResize
    }

    fn command_name(&self) -> &str {
        if self.rollback {
            "Rollback AutoScaling Group"
        } else {
            "Resize AutoScaling Group"
        }
    }

    fn plan(&self, ctx: &ExecutionContext, target: &DeploymentTarget) -> StateResult<RequestPlan> {
        let setup = ctx.service_setup()?;
        let plan = if self.rollback {
            Self::plan_rollback(setup)
        } else {
            let current = match AsgCapacities::from_context(ctx)? {
                Some(capacities) => capacities,
                None => AsgCapacities::from_setup(setup),
            };
            self.plan_forward(setup, &current)
        };

        let parameters = json!({
            "region": target.infrastructure.region,
            "provider": target.cloud_provider.provider,
            "new_group": plan.capacities.new_group,
            "old_groups": plan.capacities.old_groups,
            "resize_new_first": plan.resize_new_first,
            "rollback": self.rollback,
        });
        let label = plan.capacities.new_group.name.clone();

        Ok(RequestPlan::single(
            TaskRequest::new(label, parameters),
            serde_json::to_value(&plan)?,
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
        let plan: ResizePlan = serde_json::from_value(outcome.strategy_data.clone())?;

        let mut instances: Vec<InstanceElement> = Vec::new();
        for request in outcome.requests {
            let Some(response) = &request.response else {
                continue;
            };
            if let Some(reported) = response.payload.get("instances") {
                instances.extend(serde_json::from_value::<Vec<InstanceElement>>(reported.clone())?);
            }
        }
        let added = usize::try_from(plan.instances_to_add).unwrap_or(usize::MAX);
        instances.truncate(added);
        for instance in &mut instances {
            instance.new_instance = true;
        }

        let capacities = ContextElement::param(CAPACITY_PARAM, serde_json::to_value(&plan.capacities)?);
        let mut output = StrategyOutput {
            context_elements: vec![capacities],
            notify_elements: Vec::new(),
            result: Some(json!({
                "instances_added": instances.len(),
                "new_group": plan.capacities.new_group,
                "old_groups": plan.capacities.old_groups,
            })),
        };

        if !self.rollback {
            let list = ContextElement::InstanceList(InstanceListElement { instances });
            output.context_elements.push(list.clone());
            output.notify_elements.push(list);
        }
        Ok(output)
    }
}
