//! # Data Model
//!
//! Records the engine persists and exchanges: execution instances, contextual
//! elements, state responses and the remote task boundary.

pub mod context_element;
pub mod execution_data;
pub mod execution_response;
pub mod remote_task;
pub mod state_execution_instance;
pub mod state_type;

pub use context_element::{
    ArtifactElement, ContainerServiceElement, ContextElement, ContextElementType,
    EnvironmentElement, GroupCapacity, InstanceElement, InstanceListElement, ListenerTarget,
    PhaseElement, ServiceSetupElement, WorkflowStandardParams,
};
pub use execution_data::{ElementExecutionSummary, InstanceStatusSummary, StateExecutionData};
pub use execution_response::ExecutionResponse;
pub use remote_task::{
    ChildCompletion, CompletionStatus, EncryptionDetails, NotifyResponse, RemoteTask,
    RemoteTaskResponse, TaskScope, TaskType,
};
pub use state_execution_instance::{
    ChildInstanceBuilder, PendingWait, ReceivedResponse, StateExecutionInstance, SuccessorBuilder, WaitMode,
};
pub use state_type::StateType;
