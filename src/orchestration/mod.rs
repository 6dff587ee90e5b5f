//! # Orchestration
//!
//! The engine's control plane: workflow graphs, the orchestrator that drives
//! instances through them, the per-instance timeout monitor and the interrupt
//! queue used for aborts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stepwise_core::orchestration::{ExecutionArgs, WorkflowDefinition, WorkflowOrchestrator, WorkflowRegistry};
//! use stepwise_core::services::StateServices;
//! use std::sync::Arc;
//!
//! # async fn example(services: Arc<StateServices>, definition: WorkflowDefinition) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = WorkflowRegistry::new().with(definition)?;
//! let orchestrator = WorkflowOrchestrator::builder(registry, services).build()?;
//!
//! let mut handle = orchestrator
//!     .start_execution("deploy", ExecutionArgs::new("app-1", "acct-1"))
//!     .await?;
//! let outcome = handle.wait().await?;
//! println!("{} finished with {}", outcome.workflow_execution_id, outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod definition;
pub mod interrupts;
pub mod orchestrator;
pub mod timeout_monitor;

pub use definition::{WorkflowDefinition, WorkflowDefinitionBuilder, WorkflowRegistry};
pub use interrupts::{
    interrupt_channel, AbortReason, ExecutionInterrupt, InterruptReceiver, InterruptSender,
};
pub use orchestrator::{
    ExecutionArgs, OrchestratorBuilder, RecoveryReport, WorkflowHandle, WorkflowOrchestrator,
    WorkflowOutcome,
};
pub use timeout_monitor::TimeoutMonitor;
