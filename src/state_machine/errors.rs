use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Error types for instance state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Instance {instance_id} changed concurrently: expected {expected}, found {actual}")]
    ConcurrentTransition {
        instance_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Persistence operation failed: {0}")]
    Persistence(#[from] StoreError),
}

impl StateMachineError {
    /// Another writer won the compare-and-set; the caller's transition is moot
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentTransition { .. })
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
