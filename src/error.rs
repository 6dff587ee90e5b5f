//! # Error Taxonomy
//!
//! Two layers of errors live here:
//!
//! - [`StateError`] is what a state's `execute` / `handle_async_response` may return.
//!   Every collaborator failure is normalized into one of its three kinds at the
//!   state boundary, so the orchestrator never sees an unrecognized error.
//! - [`EngineError`] is what the orchestrator returns to its callers. It wraps the
//!   module-level errors and carries invariant violations that must not be masked.

use crate::config::ConfigurationError;
use crate::context::ContextError;
use crate::correlation::CorrelationError;
use crate::dispatch::DispatchError;
use crate::services::ServiceError;
use crate::state_machine::{ExecutionStatus, StateMachineError};
use crate::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Failure raised by a state while executing or resuming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Missing field, unresolved template, missing setting. Terminal ERROR, never retried.
    #[error("{0}")]
    Configuration(String),

    /// Infrastructure trouble such as a failed dispatch. Terminal FAILED.
    #[error("{0}")]
    Transient(String),

    /// Programming error. The instance is marked ERROR and the violation is propagated.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl StateError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Terminal status an instance receives when its state fails with this error
    pub fn terminal_status(&self) -> ExecutionStatus {
        match self {
            Self::Configuration(_) | Self::Invariant(_) => ExecutionStatus::Error,
            Self::Transient(_) => ExecutionStatus::Failed,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

impl From<ContextError> for StateError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::ElementNotFound(_) => Self::Invariant(err.to_string()),
            ContextError::UnresolvedPlaceholder { .. } | ContextError::MalformedTemplate { .. } => {
                Self::Configuration(err.to_string())
            }
        }
    }
}

impl From<ServiceError> for StateError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound { .. } | ServiceError::Invalid(_) => {
                Self::Configuration(err.to_string())
            }
            ServiceError::Unavailable(_) => Self::Transient(err.to_string()),
            ServiceError::Serialization(_) => Self::Invariant(err.to_string()),
        }
    }
}

impl From<DispatchError> for StateError {
    fn from(err: DispatchError) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invariant(format!("Serialization error: {err}"))
    }
}

pub type StateResult<T> = std::result::Result<T, StateError>;

/// Errors surfaced by the engine to its callers
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Instance store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invariant violated by instance {instance_id}: {message}")]
    InvariantViolation { instance_id: Uuid, message: String },

    #[error("Unknown workflow definition: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow {workflow} has no state named {state}")]
    UnknownState { workflow: String, state: String },

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Workflow execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Whether the error signals a corrupted state machine rather than a recoverable condition
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvariantViolation { .. } => true,
            Self::Correlation(err) => err.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
