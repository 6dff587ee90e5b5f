use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why an instance is being aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The state's timeout elapsed while suspended
    Timeout(Duration),
    /// Requested by a caller
    Manual,
    /// A container ancestor was aborted
    Cascade,
    /// Found in flight after a restart with no way to resume
    Restart,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => write!(f, "timeout"),
            Self::Manual => write!(f, "manual"),
            Self::Cascade => write!(f, "cascade"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// Requests handled by the orchestrator's interrupt loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionInterrupt {
    Abort { instance_id: Uuid, reason: AbortReason },
    /// Abort every non-terminal instance nested under a container
    AbortChildren { parent_id: Uuid },
    AbortAll { workflow_execution_id: String },
}

/// Unbounded so that sending from an abort handler never blocks
pub type InterruptSender = mpsc::UnboundedSender<ExecutionInterrupt>;
pub type InterruptReceiver = mpsc::UnboundedReceiver<ExecutionInterrupt>;

pub fn interrupt_channel() -> (InterruptSender, InterruptReceiver) {
    mpsc::unbounded_channel()
}
