use super::states::ExecutionStatus;
use serde::{Deserialize, Serialize};

/// Events that drive instance status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InstanceEvent {
    /// Begin executing the state
    Start,
    /// Decided at entry not to run
    Skip,
    /// Could not be started at all; carries ERROR or FAILED
    Fail(ExecutionStatus),
    /// State returned an asynchronous response and awaits correlation tokens
    Suspend,
    /// Awaited tokens were satisfied and the state is resuming
    Resume,
    /// State produced a terminal response
    Complete(ExecutionStatus),
    /// External interrupt or timeout
    Abort,
    /// Abort cleanup finished
    AbortCompleted,
}

impl InstanceEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Skip => "skip",
            Self::Fail(_) => "fail",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Complete(_) => "complete",
            Self::Abort => "abort",
            Self::AbortCompleted => "abort_completed",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skip | Self::Fail(_) | Self::Complete(_) | Self::AbortCompleted
        )
    }
}
