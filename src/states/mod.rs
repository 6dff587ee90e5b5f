//! # States
//!
//! A [`State`] is one executable node of a workflow graph. `execute` either finishes
//! synchronously with a terminal [`ExecutionResponse`] or suspends the instance on
//! correlation tokens; the orchestrator later calls `handle_async_response` exactly
//! once with everything delivered for those tokens.
//!
//! Concrete variants are built by composition:
//!
//! - [`RemoteCallState`] runs the shared dispatch-and-resume algorithm and delegates
//!   request building and result handling to a [`RemoteCallStrategy`]
//!   ([`ResizeAsgStrategy`], [`ListenerUpdateStrategy`], [`SteadyStateStrategy`],
//!   [`HostBatchStrategy`]).
//! - [`SubWorkflowState`] and [`ForkState`] spawn child instances and converge on
//!   their completions.

pub mod batch;
pub mod fork;
pub mod listener;
pub mod remote_call;
pub mod resize;
pub mod rollback;
pub mod steady_state;
pub mod sub_workflow;

use crate::context::ExecutionContext;
use crate::correlation::ResumeBatch;
use crate::error::{StateError, StateResult};
use crate::models::{ExecutionResponse, StateType};
use async_trait::async_trait;
use std::time::Duration;

pub use batch::HostBatchStrategy;
pub use fork::{converge, ForkItems, ForkState};
pub use listener::{ListenerAction, ListenerUpdateStrategy};
pub use remote_call::{
    CallOutcome, DeploymentTarget, RemoteCallState, RemoteCallStrategy, RequestOutcome,
    RequestPlan, StrategyOutput, TaskRequest,
};
pub use resize::{AsgCapacities, InstanceUnitType, ResizeAsgStrategy, CAPACITY_PARAM};
pub use rollback::RollbackOnce;
pub use steady_state::SteadyStateStrategy;
pub use sub_workflow::SubWorkflowState;

/// Responses handed to `handle_async_response`, keyed by token in arrival order
pub type ResponseMap = ResumeBatch;

#[async_trait]
pub trait State: Send + Sync {
    fn name(&self) -> &str;

    fn state_type(&self) -> StateType;

    /// How long the instance may stay suspended before it is aborted
    fn timeout(&self) -> Duration;

    /// Reason to skip at entry; the instance goes NEW -> SKIPPED without executing
    fn skip_reason(&self, _ctx: &ExecutionContext) -> Option<String> {
        None
    }

    /// Workflow definitions this state spawns children into
    fn child_workflows(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> StateResult<ExecutionResponse>;

    async fn handle_async_response(
        &self,
        _ctx: &ExecutionContext,
        _responses: &ResponseMap,
    ) -> StateResult<ExecutionResponse> {
        Err(StateError::invariant(format!(
            "State {} does not accept asynchronous responses",
            self.name()
        )))
    }

    /// Best-effort cleanup when the instance is aborted. Must not fail or block.
    async fn handle_abort_event(&self, _ctx: &ExecutionContext) {}
}
