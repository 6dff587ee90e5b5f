use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying which state variant an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    ResizeAsg,
    ResizeAsgRollback,
    ListenerUpdate,
    ListenerUpdateRollback,
    SteadyStateCheck,
    HostBatchCommand,
    SubWorkflow,
    Fork,
    EnvResume,
    /// States supplied by the embedding application
    Custom,
}

impl StateType {
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::ResizeAsgRollback | Self::ListenerUpdateRollback)
    }

    /// States that spawn child instances and wait on them
    pub fn is_container(&self) -> bool {
        matches!(self, Self::SubWorkflow | Self::Fork | Self::EnvResume)
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResizeAsg => "resize_asg",
            Self::ResizeAsgRollback => "resize_asg_rollback",
            Self::ListenerUpdate => "listener_update",
            Self::ListenerUpdateRollback => "listener_update_rollback",
            Self::SteadyStateCheck => "steady_state_check",
            Self::HostBatchCommand => "host_batch_command",
            Self::SubWorkflow => "sub_workflow",
            Self::Fork => "fork",
            Self::EnvResume => "env_resume",
            Self::Custom => "custom",
        };
        write!(f, "{name}")
    }
}
