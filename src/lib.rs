#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Stepwise Core
//!
//! Resumable state-machine executor for long-running deployment workflows.
//!
//! ## Overview
//!
//! A workflow is a graph of named states. Each state either finishes inline or
//! suspends after dispatching remote tasks (or spawning child instances) and is
//! resumed when every correlation token it waits on has been answered. Every
//! state invocation is persisted as a [`models::StateExecutionInstance`] so an
//! execution can be inspected, aborted or recovered after a restart.
//!
//! ## Module Organization
//!
//! - [`models`] - Instances, context elements, responses and the remote task boundary
//! - [`state_machine`] - Instance lifecycle transitions with compare-and-set semantics
//! - [`states`] - The state contract and the deployment state library
//! - [`orchestration`] - Workflow graphs, the orchestrator and timeout handling
//! - [`correlation`] - Token registry that resumes suspended instances
//! - [`context`] - Execution context and expression rendering
//! - [`dispatch`] - Remote task dispatch boundary
//! - [`services`] - Collaborator interfaces (infrastructure, secrets, activities, outputs)
//! - [`store`] - Instance persistence (in-memory and Postgres)
//! - [`events`] - Lifecycle event broadcasting
//! - [`config`] - Layered TOML configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - State and engine error types
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepwise_core::orchestration::{ExecutionArgs, WorkflowDefinition, WorkflowOrchestrator, WorkflowRegistry};
//! use stepwise_core::services::StateServices;
//! use std::sync::Arc;
//!
//! # async fn example(services: Arc<StateServices>, definition: WorkflowDefinition) -> Result<(), Box<dyn std::error::Error>> {
//! stepwise_core::logging::init_structured_logging();
//!
//! let registry = WorkflowRegistry::new().with(definition)?;
//! let orchestrator = WorkflowOrchestrator::builder(registry, services).build()?;
//!
//! let mut handle = orchestrator
//!     .start_execution("deploy", ExecutionArgs::new("app-1", "acct-1"))
//!     .await?;
//! let outcome = handle.wait().await?;
//! println!("{} -> {}", outcome.workflow_execution_id, outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib                      # Unit tests
//! cargo test                            # Unit and in-memory integration tests
//! DATABASE_URL=... cargo test -- --ignored   # Postgres-backed store tests
//! ```

pub mod config;
pub mod constants;
pub mod context;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;
pub mod states;
pub mod store;

pub use config::{ConfigManager, ConvergencePolicy, EngineConfig, TimeoutConfig};
pub use context::ExecutionContext;
pub use correlation::{CorrelationRegistry, ResumeBatch};
pub use error::{EngineError, Result, StateError, StateResult};
pub use models::{
    ContextElement, ExecutionResponse, RemoteTask, RemoteTaskResponse, StateExecutionInstance,
    StateType,
};
pub use orchestration::{
    ExecutionArgs, WorkflowDefinition, WorkflowHandle, WorkflowOrchestrator, WorkflowOutcome,
    WorkflowRegistry,
};
pub use services::StateServices;
pub use state_machine::ExecutionStatus;
pub use states::State;
