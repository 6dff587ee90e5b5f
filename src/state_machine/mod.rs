// Instance state machine
//
// Status enum, transition events and the compare-and-set transition driver used by
// the orchestrator for every StateExecutionInstance.

pub mod errors;
pub mod events;
pub mod instance_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::InstanceEvent;
pub use instance_state_machine::{determine_target_state, InstanceStateMachine};
pub use states::ExecutionStatus;
