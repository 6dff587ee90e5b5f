//! Contextual elements: typed values pushed by states and visible to their descendants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Capability tag used for typed lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextElementType {
    Standard,
    Phase,
    Environment,
    Artifact,
    ServiceSetup,
    InstanceList,
    ContainerService,
    Param,
}

impl fmt::Display for ContextElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standard => "standard",
            Self::Phase => "phase",
            Self::Environment => "environment",
            Self::Artifact => "artifact",
            Self::ServiceSetup => "service_setup",
            Self::InstanceList => "instance_list",
            Self::ContainerService => "container_service",
            Self::Param => "param",
        };
        write!(f, "{name}")
    }
}

/// Standard workflow parameters supplied when the execution starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStandardParams {
    pub app_id: String,
    pub env_id: Option<String>,
    pub build_no: Option<String>,
    pub triggered_by: Option<String>,
}

/// Deployment phase the states below it belong to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseElement {
    pub phase_name: String,
    pub service_id: String,
    pub infra_mapping_id: String,
    pub deployment_type: String,
    #[serde(default)]
    pub rollback: bool,
    /// For rollback phases, the forward phase being reversed
    pub phase_name_for_rollback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentElement {
    pub env_id: String,
    pub name: String,
    pub environment_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactElement {
    pub artifact_id: String,
    pub build_no: String,
    pub source: Option<String>,
}

/// Desired capacity of one auto scaling group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCapacity {
    pub name: String,
    pub desired: u32,
}

/// Listener and target groups a traffic shift acts on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTarget {
    pub listener_id: String,
    pub old_target_group: String,
    pub new_target_group: String,
    /// Stage target group used by blue/green swaps
    pub stage_target_group: Option<String>,
}

/// Result of the service setup step, consumed by resize and listener states
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSetupElement {
    /// New group and its capacity before this deployment
    pub new_group: GroupCapacity,
    /// Old groups and their capacities before this deployment, drained in order
    pub old_groups: Vec<GroupCapacity>,
    /// Total instances the deployment should end with
    pub desired_instances: u32,
    #[serde(default)]
    pub resize_new_first: bool,
    #[serde(default)]
    pub blue_green: bool,
    pub listener: Option<ListenerTarget>,
}

/// One host discovered or created by a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceElement {
    pub instance_id: String,
    pub host_name: String,
    pub group_name: Option<String>,
    #[serde(default)]
    pub new_instance: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceListElement {
    pub instances: Vec<InstanceElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerServiceElement {
    pub service_name: String,
    pub cluster_name: String,
    pub desired_count: u32,
    pub running_count: u32,
}

/// Typed value visible to a state and its descendants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element_type", rename_all = "snake_case")]
pub enum ContextElement {
    Standard(WorkflowStandardParams),
    Phase(PhaseElement),
    Environment(EnvironmentElement),
    Artifact(ArtifactElement),
    ServiceSetup(ServiceSetupElement),
    InstanceList(InstanceListElement),
    ContainerService(ContainerServiceElement),
    Param { name: String, value: Value },
}

impl ContextElement {
    pub fn param(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Param {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn element_type(&self) -> ContextElementType {
        match self {
            Self::Standard(_) => ContextElementType::Standard,
            Self::Phase(_) => ContextElementType::Phase,
            Self::Environment(_) => ContextElementType::Environment,
            Self::Artifact(_) => ContextElementType::Artifact,
            Self::ServiceSetup(_) => ContextElementType::ServiceSetup,
            Self::InstanceList(_) => ContextElementType::InstanceList,
            Self::ContainerService(_) => ContextElementType::ContainerService,
            Self::Param { .. } => ContextElementType::Param,
        }
    }

    /// Name an element answers to as the first segment of a `${...}` expression
    pub fn expression_key(&self) -> &str {
        match self {
            Self::Standard(_) => "workflow",
            Self::Phase(_) => "phase",
            Self::Environment(_) => "env",
            Self::Artifact(_) => "artifact",
            Self::ServiceSetup(_) => "setup",
            Self::InstanceList(_) => "instances",
            Self::ContainerService(_) => "service",
            Self::Param { name, .. } => name,
        }
    }

    /// Short label used in fork summaries and logs
    pub fn display_name(&self) -> String {
        match self {
            Self::Standard(params) => params.app_id.clone(),
            Self::Phase(phase) => phase.phase_name.clone(),
            Self::Environment(env) => env.name.clone(),
            Self::Artifact(artifact) => artifact.build_no.clone(),
            Self::ServiceSetup(setup) => setup.new_group.name.clone(),
            Self::InstanceList(list) => list
                .instances
                .iter()
                .map(|instance| instance.host_name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            Self::ContainerService(service) => service.service_name.clone(),
            Self::Param { name, .. } => name.clone(),
        }
    }

    /// Value navigated by expression rendering
    pub fn expression_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Param { value, .. } => Ok(value.clone()),
            other => serde_json::to_value(other),
        }
    }
}
