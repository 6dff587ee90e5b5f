use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a single state execution instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started
    #[default]
    New,
    /// Executing, or suspended awaiting asynchronous responses
    Running,
    /// Abort requested, cleanup in progress
    Aborting,
    /// Completed successfully
    Success,
    /// Completed with a failure (remote failure, timeout, abort)
    Failed,
    /// Completed with a configuration or internal error
    Error,
    /// Decided at entry not to run
    Skipped,
}

impl ExecutionStatus {
    /// Check if this is a terminal status (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Error | Self::Skipped
        )
    }

    /// Check if the instance is in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Aborting)
    }

    /// Statuses that continue along the success edge of the workflow graph
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Ranking used by the worst-of convergence policy
    pub fn severity(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Skipped => 1,
            Self::New | Self::Running | Self::Aborting => 2,
            Self::Failed => 3,
            Self::Error => 4,
        }
    }

    /// Pick the more severe of two statuses, keeping `self` on ties
    pub fn worst_of(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Aborting => write!(f, "aborting"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "running" => Ok(Self::Running),
            "aborting" => Ok(Self::Aborting),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}
