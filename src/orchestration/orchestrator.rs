//! # Workflow Orchestrator
//!
//! Drives instances through their lifecycle:
//!
//! 1. `run_instance` skips, or starts and executes a NEW instance.
//! 2. A terminal response completes it; an asynchronous one suspends it on its
//!    correlation tokens, arms its timeout and spawns any children.
//! 3. `deliver` routes responses through the [`CorrelationRegistry`]; the delivery
//!    that satisfies a wait resumes the instance exactly once.
//! 4. A terminal instance follows its success or failure edge. At the end of a branch
//!    the outcome goes to the parent's token, or completes the workflow handle.
//!
//! Every status change goes through the compare-and-set [`InstanceStateMachine`].
//! A caller that loses a race (a resume against an abort, two timeouts) finds its
//! transition superseded and stops quietly.
//!
//! Aborts, cascades and timeouts arrive over an unbounded interrupt queue drained by
//! a background loop that holds only a weak reference to the orchestrator.

use super::definition::{WorkflowDefinition, WorkflowRegistry};
use super::interrupts::{
    interrupt_channel, AbortReason, ExecutionInterrupt, InterruptReceiver, InterruptSender,
};
use super::timeout_monitor::TimeoutMonitor;
use crate::config::{ConfigurationError, EngineConfig};
use crate::constants::humanize_duration;
use crate::context::ExecutionContext;
use crate::correlation::{
    CorrelationRegistry, CorrelationResult, DeliveryOutcome, RegisterOutcome, ResumeBatch,
};
use crate::error::{EngineError, Result, StateResult};
use crate::events::{EngineEvent, EventPublisher, PublishedEvent};
use crate::logging::{log_correlation_operation, log_error, log_instance_operation};
use crate::models::{
    ChildCompletion, ChildInstanceBuilder, ContextElement, ContextElementType, ExecutionResponse,
    NotifyResponse, PendingWait, StateExecutionInstance, SuccessorBuilder, WaitMode,
    WorkflowStandardParams,
};
use crate::services::StateServices;
use crate::state_machine::{ExecutionStatus, InstanceEvent, InstanceStateMachine, StateMachineError};
use crate::states::State;
use crate::store::{InMemoryInstanceStore, InstanceStore, InstanceUpdate};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Arguments for starting a workflow execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionArgs {
    /// Generated when absent
    pub workflow_execution_id: Option<String>,
    pub app_id: String,
    pub account_id: String,
    /// Seeded on the first instance, oldest first
    pub context_elements: Vec<ContextElement>,
}

impl ExecutionArgs {
    pub fn new(app_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            account_id: account_id.into(),
            ..Self::default()
        }
    }

    pub fn with_execution_id(mut self, workflow_execution_id: impl Into<String>) -> Self {
        self.workflow_execution_id = Some(workflow_execution_id.into());
        self
    }

    pub fn with_element(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }
}

/// Final result of a workflow execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutcome {
    pub workflow_execution_id: String,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

/// Caller's view of a started execution
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_execution_id: String,
    root_instance_id: Uuid,
    receiver: watch::Receiver<Option<WorkflowOutcome>>,
}

impl WorkflowHandle {
    pub fn workflow_execution_id(&self) -> &str {
        &self.workflow_execution_id
    }

    pub fn root_instance_id(&self) -> Uuid {
        self.root_instance_id
    }

    /// Outcome if the execution already finished
    pub fn outcome(&self) -> Option<WorkflowOutcome> {
        self.receiver.borrow().clone()
    }

    /// Wait until the execution finishes
    pub async fn wait(&mut self) -> Result<WorkflowOutcome> {
        loop {
            if let Some(outcome) = self.receiver.borrow_and_update().clone() {
                return Ok(outcome);
            }
            self.receiver
                .changed()
                .await
                .map_err(|_| EngineError::ShuttingDown)?;
        }
    }
}

/// What `recover` did with the instances it found in flight
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Suspended instances whose wait and timer were re-registered
    pub rearmed: usize,
    /// Instances that could not be resumed and were aborted
    pub aborted: usize,
    /// Aborts interrupted mid-way and completed now
    pub completed_aborts: usize,
    /// NEW instances that had not been started yet
    pub started: usize,
}

struct Inner {
    registry: WorkflowRegistry,
    store: Arc<dyn InstanceStore>,
    state_machine: InstanceStateMachine,
    correlation: CorrelationRegistry,
    services: Arc<StateServices>,
    config: Arc<EngineConfig>,
    events: EventPublisher,
    timeouts: TimeoutMonitor,
    interrupts: InterruptSender,
    executions: DashMap<String, watch::Sender<Option<WorkflowOutcome>>>,
    /// Executions being aborted as a whole; their branches stop at the current node
    halted: DashSet<String>,
}

pub struct OrchestratorBuilder {
    registry: WorkflowRegistry,
    services: Arc<StateServices>,
    store: Option<Arc<dyn InstanceStore>>,
    config: Option<EngineConfig>,
    events: Option<EventPublisher>,
}

impl OrchestratorBuilder {
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn event_publisher(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the registry and configuration and start the interrupt loop.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<WorkflowOrchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        self.registry.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| EventPublisher::new(config.orchestrator.event_channel_capacity));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryInstanceStore::new()) as Arc<dyn InstanceStore>);
        let (interrupts, receiver) = interrupt_channel();

        let inner = Arc::new(Inner {
            registry: self.registry,
            state_machine: InstanceStateMachine::new(store.clone(), events.clone()),
            store,
            correlation: CorrelationRegistry::new(),
            services: self.services,
            config: Arc::new(config),
            events,
            timeouts: TimeoutMonitor::new(interrupts.clone()),
            interrupts,
            executions: DashMap::new(),
            halted: DashSet::new(),
        });

        spawn_interrupt_loop(Arc::downgrade(&inner), receiver);
        spawn_token_sweeper(
            Arc::downgrade(&inner),
            Duration::from_secs(inner.config.orchestrator.token_sweep_interval_secs),
        );
        info!(workflows = inner.registry.len(), "Workflow orchestrator started");

        Ok(WorkflowOrchestrator { inner })
    }
}

fn spawn_interrupt_loop(inner: Weak<Inner>, mut receiver: InterruptReceiver) {
    tokio::spawn(async move {
        while let Some(interrupt) = receiver.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let orchestrator = WorkflowOrchestrator { inner };
            tokio::spawn(async move {
                let description = format!("{interrupt:?}");
                if let Err(err) = orchestrator.handle_interrupt(interrupt).await {
                    log_error(
                        "orchestrator",
                        "handle_interrupt",
                        &err.to_string(),
                        Some(&description),
                    );
                }
            });
        }
        debug!("Interrupt loop stopped");
    });
}

/// Periodically forgets retired tokens past their retention
fn spawn_token_sweeper(inner: Weak<Inner>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let pruned = WorkflowOrchestrator { inner }.prune_consumed_tokens();
            if pruned > 0 {
                debug!(pruned = pruned, "Swept retired correlation tokens");
            }
        }
        debug!("Token sweeper stopped");
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type StateOutcome = std::result::Result<StateResult<ExecutionResponse>, Box<dyn Any + Send>>;

/// Runs workflow executions against a fixed [`WorkflowRegistry`]
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("workflows", &self.inner.registry.len())
            .field("pending_waits", &self.inner.correlation.pending_count())
            .field("running_executions", &self.inner.executions.len())
            .finish()
    }
}

impl WorkflowOrchestrator {
    pub fn builder(registry: WorkflowRegistry, services: Arc<StateServices>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            services,
            store: None,
            config: None,
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn correlation(&self) -> &CorrelationRegistry {
        &self.inner.correlation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.inner.events.subscribe()
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<StateExecutionInstance> {
        self.load(instance_id).await
    }

    pub async fn instances(&self, workflow_execution_id: &str) -> Result<Vec<StateExecutionInstance>> {
        Ok(self
            .inner
            .store
            .by_workflow_execution(workflow_execution_id)
            .await?)
    }

    /// Forget retired tokens older than the configured retention. Also runs on the
    /// `token_sweep_interval_secs` timer.
    pub fn prune_consumed_tokens(&self) -> usize {
        let retention = Duration::from_secs(self.inner.config.orchestrator.consumed_token_retention_secs);
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.inner.correlation.prune_consumed(cutoff)
    }

    /// Create the first instance of a new execution and run it until it completes or suspends
    #[instrument(skip(self, args))]
    pub async fn start_execution(
        &self,
        definition_id: &str,
        args: ExecutionArgs,
    ) -> Result<WorkflowHandle> {
        let definition = self.definition(definition_id)?;
        let initial = definition.initial_state();
        let state = definition
            .state(initial)
            .ok_or_else(|| EngineError::UnknownState {
                workflow: definition_id.to_string(),
                state: initial.to_string(),
            })?;

        let workflow_execution_id = args
            .workflow_execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.inner.executions.contains_key(&workflow_execution_id) {
            return Err(ConfigurationError::invalid_value(
                "workflow_execution_id",
                &workflow_execution_id,
                "execution is already running",
            )
            .into());
        }

        let mut elements = args.context_elements;
        if !elements
            .iter()
            .any(|element| element.element_type() == ContextElementType::Standard)
        {
            elements.insert(
                0,
                ContextElement::Standard(WorkflowStandardParams {
                    app_id: args.app_id.clone(),
                    ..WorkflowStandardParams::default()
                }),
            );
        }

        let instance = StateExecutionInstance::new(
            &workflow_execution_id,
            args.app_id,
            args.account_id,
            definition_id,
            initial,
            state.state_type(),
        )
        .with_context_elements(elements);
        let root_instance_id = instance.id;

        let (sender, receiver) = watch::channel(None);
        self.inner
            .executions
            .insert(workflow_execution_id.clone(), sender);
        self.inner.store.insert(instance).await?;

        info!(
            workflow_execution_id = %workflow_execution_id,
            instance_id = %root_instance_id,
            state = %initial,
            "Workflow execution started"
        );

        self.run_instance(root_instance_id).await?;

        Ok(WorkflowHandle {
            workflow_execution_id,
            root_instance_id,
            receiver,
        })
    }

    /// Persist and run an instance built by the caller. It must be NEW.
    pub async fn trigger_execution(&self, instance: StateExecutionInstance) -> Result<()> {
        if instance.status != ExecutionStatus::New {
            return Err(StateMachineError::InvalidTransition {
                from: instance.status.to_string(),
                event: InstanceEvent::Start.event_type().to_string(),
            }
            .into());
        }
        let instance_id = instance.id;
        self.inner.store.insert(instance).await?;
        self.run_instance(instance_id).await
    }

    /// Deliver a response to a correlation token, resuming its instance when this
    /// delivery satisfies the wait. Duplicate deliveries are fatal errors.
    pub async fn deliver(
        &self,
        token: &str,
        response: impl Into<NotifyResponse>,
    ) -> Result<DeliveryOutcome> {
        let outcome = match self.inner.correlation.deliver(token, response.into()) {
            Ok(outcome) => outcome,
            Err(err) => {
                log_error("correlation", "deliver", &err.to_string(), Some(token));
                return Err(err.into());
            }
        };

        let label = match &outcome {
            DeliveryOutcome::Pending { .. } => "pending",
            DeliveryOutcome::Parked => "parked",
            DeliveryOutcome::Satisfied(_) => "satisfied",
            DeliveryOutcome::Ignored => "ignored",
        };
        let owner = match &outcome {
            DeliveryOutcome::Satisfied(batch) => Some(batch.instance_id),
            DeliveryOutcome::Pending { instance_id } => Some(*instance_id),
            _ => None,
        };
        log_correlation_operation("deliver", token, owner, label);

        match &outcome {
            DeliveryOutcome::Satisfied(batch) => self.resume(batch.clone()).await?,
            DeliveryOutcome::Pending { instance_id } => self.persist_received(*instance_id).await?,
            DeliveryOutcome::Parked | DeliveryOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    pub async fn abort(&self, instance_id: Uuid) -> Result<()> {
        self.abort_with(instance_id, AbortReason::Manual).await
    }

    /// Abort every in-flight instance of an execution; no successors are started
    pub async fn abort_all(&self, workflow_execution_id: &str) -> Result<()> {
        let instances = self
            .inner
            .store
            .by_workflow_execution(workflow_execution_id)
            .await?;
        if instances.is_empty() {
            return Err(EngineError::ExecutionNotFound(
                workflow_execution_id.to_string(),
            ));
        }

        let active: Vec<Uuid> = instances
            .iter()
            .filter(|instance| !instance.is_terminal() && instance.status != ExecutionStatus::Aborting)
            .map(|instance| instance.id)
            .collect();
        if active.is_empty() {
            return Ok(());
        }

        info!(
            workflow_execution_id = %workflow_execution_id,
            instances = active.len(),
            "Aborting workflow execution"
        );
        self.inner.halted.insert(workflow_execution_id.to_string());

        let results = join_all(
            active
                .into_iter()
                .map(|instance_id| self.abort_with(instance_id, AbortReason::Manual)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Re-register waits and timers for instances left in flight by a previous process.
    ///
    /// Suspended instances with a persisted wait are re-armed with whatever time is
    /// left before their deadline. Instances caught mid-execution cannot be resumed
    /// and are aborted. Interrupted aborts are completed.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for instance in self
            .inner
            .store
            .list_by_status(ExecutionStatus::Aborting)
            .await?
        {
            let message = format!("Aborted after {}", humanize_duration(self.elapsed(&instance)));
            let update = InstanceUpdate::new()
                .with_error_message(Some(message))
                .clear_pending_wait()
                .ended_now();
            if let Some(failed) = self
                .transition(instance.id, InstanceEvent::AbortCompleted, update)
                .await?
            {
                report.completed_aborts += 1;
                self.on_terminal(failed).await?;
            }
        }

        for instance in self
            .inner
            .store
            .list_by_status(ExecutionStatus::Running)
            .await?
        {
            if self.inner.correlation.has_wait(instance.id) {
                continue;
            }
            let Some(wait) = instance.pending_wait.clone() else {
                warn!(
                    instance_id = %instance.id,
                    state = %instance.state_name,
                    "Instance was executing when the previous process stopped"
                );
                report.aborted += 1;
                self.abort_with(instance.id, AbortReason::Restart).await?;
                continue;
            };

            let remaining = (wait.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                let timeout = self
                    .resolve_state(&instance)
                    .map(|state| state.timeout())
                    .unwrap_or(Duration::ZERO);
                report.aborted += 1;
                self.abort_with(instance.id, AbortReason::Timeout(timeout))
                    .await?;
                continue;
            }

            report.rearmed += 1;
            self.inner.timeouts.arm(instance.id, remaining);
            let restored = self
                .inner
                .correlation
                .restore_wait(instance.id, &wait.tokens, wait.mode, wait.received.clone());
            match self.registered(&instance, restored).await? {
                Some(RegisterOutcome::Satisfied(batch)) => self.resume(batch).await?,
                Some(RegisterOutcome::Waiting) => self.persist_received(instance.id).await?,
                None => {}
            }
        }

        for instance in self.inner.store.list_by_status(ExecutionStatus::New).await? {
            report.started += 1;
            self.run_instance(instance.id).await?;
        }

        info!(
            rearmed = report.rearmed,
            aborted = report.aborted,
            completed_aborts = report.completed_aborts,
            started = report.started,
            "Recovery finished"
        );
        Ok(report)
    }

    async fn handle_interrupt(&self, interrupt: ExecutionInterrupt) -> Result<()> {
        match interrupt {
            ExecutionInterrupt::Abort {
                instance_id,
                reason,
            } => self.abort_with(instance_id, reason).await,
            ExecutionInterrupt::AbortChildren { parent_id } => self.abort_children(parent_id).await,
            ExecutionInterrupt::AbortAll {
                workflow_execution_id,
            } => self.abort_all(&workflow_execution_id).await,
        }
    }

    async fn abort_children(&self, parent_id: Uuid) -> Result<()> {
        let children = self.inner.store.children_of(parent_id).await?;
        let active: Vec<Uuid> = children
            .iter()
            .filter(|child| !child.is_terminal() && child.status != ExecutionStatus::Aborting)
            .map(|child| child.id)
            .collect();
        debug!(parent_id = %parent_id, children = active.len(), "Aborting nested instances");

        let results = join_all(
            active
                .into_iter()
                .map(|child_id| self.abort_with(child_id, AbortReason::Cascade)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn abort_with(&self, instance_id: Uuid, reason: AbortReason) -> BoxFuture<'_, Result<()>> {
        async move {
            let instance = self.load(instance_id).await?;
            if instance.is_terminal() || instance.status == ExecutionStatus::Aborting {
                debug!(instance_id = %instance_id, status = %instance.status, "Abort is a no-op");
                return Ok(());
            }

            let Some(aborting) = self
                .transition(instance_id, InstanceEvent::Abort, InstanceUpdate::new())
                .await?
            else {
                return Ok(());
            };
            self.inner.timeouts.cancel(instance_id);
            self.inner.correlation.cancel(instance_id);

            if let Ok(state) = self.resolve_state(&aborting) {
                let ctx = self.context_for(&aborting).await?;
                let cleanup = AssertUnwindSafe(state.handle_abort_event(&ctx)).catch_unwind();
                match tokio::time::timeout(self.inner.config.timeouts.abort_handler(), cleanup).await {
                    Ok(Ok(())) => {}
                    Ok(Err(panic)) => warn!(
                        instance_id = %instance_id,
                        panic = %panic_message(panic),
                        "Abort handler panicked"
                    ),
                    Err(_) => warn!(instance_id = %instance_id, "Abort handler timed out"),
                }
            }

            let message = match reason {
                AbortReason::Timeout(limit) => format!(
                    "{} not completed within {}",
                    aborting.state_name,
                    humanize_duration(limit)
                ),
                _ => format!("Aborted after {}", humanize_duration(self.elapsed(&aborting))),
            };
            let update = InstanceUpdate::new()
                .with_error_message(Some(message.clone()))
                .clear_pending_wait()
                .ended_now();
            let Some(failed) = self
                .transition(instance_id, InstanceEvent::AbortCompleted, update)
                .await?
            else {
                return Ok(());
            };

            warn!(
                instance_id = %instance_id,
                state = %failed.state_name,
                reason = %reason,
                message = %message,
                "Instance aborted"
            );
            self.on_terminal(failed).await
        }
        .boxed()
    }

    fn run_instance(&self, instance_id: Uuid) -> BoxFuture<'_, Result<()>> {
        async move {
            let instance = self.load(instance_id).await?;
            if instance.status != ExecutionStatus::New {
                debug!(instance_id = %instance_id, status = %instance.status, "Instance already started");
                return Ok(());
            }

            let state = match self.resolve_state(&instance) {
                Ok(state) => state,
                Err(err) => {
                    let update = InstanceUpdate::new()
                        .with_error_message(Some(err.to_string()))
                        .ended_now();
                    if let Some(failed) = self
                        .transition(instance_id, InstanceEvent::Fail(ExecutionStatus::Error), update)
                        .await?
                    {
                        self.on_terminal(failed).await?;
                    }
                    return Err(err);
                }
            };

            let ctx = self.context_for(&instance).await?;
            if let Some(reason) = state.skip_reason(&ctx) {
                info!(instance_id = %instance_id, state = %instance.state_name, reason = %reason, "Skipping state");
                let update = InstanceUpdate::new()
                    .with_error_message(Some(reason))
                    .ended_now();
                if let Some(skipped) = self
                    .transition(instance_id, InstanceEvent::Skip, update)
                    .await?
                {
                    self.on_terminal(skipped).await?;
                }
                return Ok(());
            }

            let Some(running) = self
                .transition(instance_id, InstanceEvent::Start, InstanceUpdate::new().started_now())
                .await?
            else {
                return Ok(());
            };
            log_instance_operation("execute", instance_id, &running.state_name, running.status, None);

            let ctx = self.context_for(&running).await?;
            let outcome = AssertUnwindSafe(state.execute(&ctx)).catch_unwind().await;
            self.apply_response(running, state, outcome).await
        }
        .boxed()
    }

    fn resume(&self, batch: ResumeBatch) -> BoxFuture<'_, Result<()>> {
        async move {
            let instance_id = batch.instance_id;
            self.inner.timeouts.cancel(instance_id);

            let Some(resumed) = self
                .transition(
                    instance_id,
                    InstanceEvent::Resume,
                    InstanceUpdate::new().clear_pending_wait(),
                )
                .await?
            else {
                self.inner.correlation.cancel(instance_id);
                return Ok(());
            };
            self.inner.correlation.release(instance_id);
            log_instance_operation(
                "resume",
                instance_id,
                &resumed.state_name,
                resumed.status,
                Some(&format!("{} responses", batch.len())),
            );

            let state = self.resolve_state(&resumed)?;
            let ctx = self.context_for(&resumed).await?;
            let outcome = AssertUnwindSafe(state.handle_async_response(&ctx, &batch))
                .catch_unwind()
                .await;
            self.apply_response(resumed, state, outcome).await
        }
        .boxed()
    }

    async fn apply_response(
        &self,
        instance: StateExecutionInstance,
        state: Arc<dyn State>,
        outcome: StateOutcome,
    ) -> Result<()> {
        let response = match outcome {
            Err(panic) => {
                let message = format!("State {} panicked: {}", instance.state_name, panic_message(panic));
                error!(instance_id = %instance.id, state = %instance.state_name, message = %message, "State panicked");
                let response = ExecutionResponse::terminal(ExecutionStatus::Error).with_error_message(message);
                return self.complete(&instance, response).await;
            }
            Ok(Err(err)) => {
                let status = err.terminal_status();
                if err.is_fatal() {
                    error!(instance_id = %instance.id, state = %instance.state_name, error = %err, "Invariant violated");
                } else {
                    warn!(instance_id = %instance.id, state = %instance.state_name, status = %status, error = %err, "State failed");
                }
                let response = ExecutionResponse::terminal(status).with_error_message(err.to_string());
                self.complete(&instance, response).await?;
                if err.is_fatal() {
                    return Err(EngineError::InvariantViolation {
                        instance_id: instance.id,
                        message: err.to_string(),
                    });
                }
                return Ok(());
            }
            Ok(Ok(response)) => response,
        };

        if response.is_async {
            return self.suspend(instance, state, response).await;
        }
        if !response.status.is_terminal() {
            let message = format!(
                "State {} returned non-terminal status {} synchronously",
                instance.state_name, response.status
            );
            let failure = ExecutionResponse::terminal(ExecutionStatus::Error).with_error_message(message.clone());
            self.complete(&instance, failure).await?;
            return Err(EngineError::InvariantViolation {
                instance_id: instance.id,
                message,
            });
        }
        self.complete(&instance, response).await
    }

    async fn complete(&self, instance: &StateExecutionInstance, response: ExecutionResponse) -> Result<()> {
        let status = response.status;
        let update = InstanceUpdate::new()
            .with_execution_data(response.state_execution_data)
            .with_context_elements(response.context_elements)
            .with_notify_elements(response.notify_elements)
            .with_error_message(response.error_message)
            .clear_pending_wait()
            .ended_now();

        match self
            .transition(instance.id, InstanceEvent::Complete(status), update)
            .await?
        {
            Some(done) => {
                log_instance_operation("complete", done.id, &done.state_name, done.status, done.error_message.as_deref());
                self.on_terminal(done).await
            }
            None => Ok(()),
        }
    }

    async fn suspend(
        &self,
        instance: StateExecutionInstance,
        state: Arc<dyn State>,
        response: ExecutionResponse,
    ) -> Result<()> {
        let tokens = response.correlation_ids.clone();
        if tokens.is_empty() {
            let message = format!("State {} suspended without correlation tokens", instance.state_name);
            let failure = ExecutionResponse::terminal(ExecutionStatus::Error).with_error_message(message.clone());
            self.complete(&instance, failure).await?;
            return Err(EngineError::InvariantViolation {
                instance_id: instance.id,
                message,
            });
        }

        let timeout = state.timeout();
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let wait = PendingWait::new(tokens.clone(), response.wait_mode, deadline);
        let task_ids = response
            .state_execution_data
            .as_ref()
            .map(|data| data.task_ids.clone())
            .unwrap_or_default();

        let update = InstanceUpdate::new()
            .with_execution_data(response.state_execution_data)
            .with_context_elements(response.context_elements)
            .with_notify_elements(response.notify_elements)
            .with_pending_wait(wait);
        let Some(suspended) = self
            .transition(instance.id, InstanceEvent::Suspend, update)
            .await?
        else {
            return Ok(());
        };

        for (token, task_id) in tokens
            .iter()
            .zip(task_ids.iter().skip(task_ids.len().saturating_sub(tokens.len())))
        {
            self.inner.events.publish(EngineEvent::TaskQueued {
                instance_id: suspended.id,
                task_id: task_id.clone(),
                wait_id: token.clone(),
            });
        }

        self.inner.timeouts.arm(suspended.id, timeout);
        let registered = self
            .register_wait(&suspended, &tokens, response.wait_mode)
            .await?;
        let Some(registered) = registered else {
            return Ok(());
        };
        debug!(
            instance_id = %suspended.id,
            state = %suspended.state_name,
            tokens = tokens.len(),
            timeout = %humanize_duration(timeout),
            "Instance suspended"
        );

        self.spawn_children(&suspended, response.spawn).await?;

        match registered {
            RegisterOutcome::Satisfied(batch) => self.resume(batch).await?,
            RegisterOutcome::Waiting => self.persist_received(suspended.id).await?,
        }
        Ok(())
    }

    async fn register_wait(
        &self,
        instance: &StateExecutionInstance,
        tokens: &[String],
        mode: WaitMode,
    ) -> Result<Option<RegisterOutcome>> {
        let outcome = self.inner.correlation.register_wait(instance.id, tokens, mode);
        self.registered(instance, outcome).await
    }

    /// `None` when registration failed and the instance was completed with ERROR
    async fn registered(
        &self,
        instance: &StateExecutionInstance,
        outcome: CorrelationResult<RegisterOutcome>,
    ) -> Result<Option<RegisterOutcome>> {
        match outcome {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.inner.timeouts.cancel(instance.id);
                let message = err.to_string();
                error!(instance_id = %instance.id, error = %message, "Failed to register correlation wait");
                let failure = ExecutionResponse::terminal(ExecutionStatus::Error).with_error_message(message.clone());
                self.complete(instance, failure).await?;
                if err.is_fatal() {
                    return Err(EngineError::InvariantViolation {
                        instance_id: instance.id,
                        message,
                    });
                }
                Err(err.into())
            }
        }
    }

    /// Record the responses a still-waiting instance has received on its persisted
    /// wait, so a restarted process can resume it without them being redelivered
    async fn persist_received(&self, instance_id: Uuid) -> Result<()> {
        let received = self.inner.correlation.received(instance_id);
        if received.is_empty() {
            return Ok(());
        }
        let count = received.len();
        let recorded = self
            .inner
            .store
            .transition(
                instance_id,
                ExecutionStatus::Running,
                ExecutionStatus::Running,
                InstanceUpdate::new().with_received_responses(received),
            )
            .await?;
        debug!(
            instance_id = %instance_id,
            received = count,
            recorded = recorded.is_some(),
            "Persisted received responses"
        );
        Ok(())
    }

    async fn spawn_children(
        &self,
        parent: &StateExecutionInstance,
        children: Vec<ChildInstanceBuilder>,
    ) -> Result<()> {
        if children.is_empty() {
            return Ok(());
        }

        let mut child_ids = Vec::with_capacity(children.len());
        for builder in children {
            let definition = self.definition(builder.graph_id())?;
            let state_name = builder
                .requested_state()
                .unwrap_or(definition.initial_state())
                .to_string();
            let state = definition
                .state(&state_name)
                .ok_or_else(|| EngineError::UnknownState {
                    workflow: definition.id().to_string(),
                    state: state_name.clone(),
                })?;
            let child = builder.build(&state_name, state.state_type());
            child_ids.push(child.id);
            self.inner.store.insert(child).await?;
        }

        debug!(parent_id = %parent.id, children = child_ids.len(), "Triggering child instances");
        let results = join_all(child_ids.into_iter().map(|id| self.run_instance(id))).await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn on_terminal(&self, instance: StateExecutionInstance) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Some(parent_id) = instance.parent_instance_id {
                let parent = self.load(parent_id).await?;
                if parent.status != ExecutionStatus::Running {
                    debug!(
                        instance_id = %instance.id,
                        parent_id = %parent_id,
                        parent_status = %parent.status,
                        "Parent no longer waiting, branch stops here"
                    );
                    return Ok(());
                }
            }

            let halted = self.inner.halted.contains(&instance.workflow_execution_id);
            let definition = self.definition(instance.graph_id())?;
            if !halted {
                if let Some(next_name) = definition.next_state(&instance.state_name, instance.status) {
                    let state = definition
                        .state(next_name)
                        .ok_or_else(|| EngineError::UnknownState {
                            workflow: definition.id().to_string(),
                            state: next_name.to_string(),
                        })?;
                    let next = SuccessorBuilder::from_completed(&instance).build(next_name, state.state_type());
                    let next_id = next.id;
                    debug!(
                        instance_id = %instance.id,
                        status = %instance.status,
                        next = %next_name,
                        "Following transition"
                    );
                    self.inner.store.insert(next).await?;
                    return self.run_instance(next_id).await;
                }
            }

            let (status, error_message) = self.branch_outcome(&instance).await?;
            match instance.notify_id.clone() {
                Some(token) => {
                    let completion = ChildCompletion {
                        instance_id: instance.id,
                        state_name: instance.state_name.clone(),
                        status,
                        error_message,
                        notify_elements: instance.notify_elements.clone(),
                    };
                    self.deliver(&token, completion).await.map(|_| ())
                }
                None => {
                    self.complete_workflow(&instance.workflow_execution_id, status, error_message);
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// First non-successful status along the branch, oldest first. All-skipped
    /// branches are SKIPPED.
    async fn branch_outcome(
        &self,
        last: &StateExecutionInstance,
    ) -> Result<(ExecutionStatus, Option<String>)> {
        let mut chain = vec![(last.status, last.error_message.clone())];
        let mut previous = last.prev_instance_id;
        while let Some(previous_id) = previous {
            let instance = self.load(previous_id).await?;
            chain.push((instance.status, instance.error_message.clone()));
            previous = instance.prev_instance_id;
        }
        chain.reverse();

        if let Some((status, message)) = chain.iter().find(|(status, _)| !status.is_successful()) {
            return Ok((*status, message.clone()));
        }
        if chain.iter().all(|(status, _)| *status == ExecutionStatus::Skipped) {
            return Ok((ExecutionStatus::Skipped, None));
        }
        Ok((ExecutionStatus::Success, None))
    }

    fn complete_workflow(
        &self,
        workflow_execution_id: &str,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) {
        self.inner.halted.remove(workflow_execution_id);
        if let Some((_, sender)) = self.inner.executions.remove(workflow_execution_id) {
            sender.send_replace(Some(WorkflowOutcome {
                workflow_execution_id: workflow_execution_id.to_string(),
                status,
                error_message: error_message.clone(),
            }));
        }
        self.inner.events.publish(EngineEvent::WorkflowCompleted {
            workflow_execution_id: workflow_execution_id.to_string(),
            status,
        });
        info!(
            workflow_execution_id = %workflow_execution_id,
            status = %status,
            error = error_message.as_deref().unwrap_or("-"),
            "Workflow execution completed"
        );
    }

    async fn transition(
        &self,
        instance_id: Uuid,
        event: InstanceEvent,
        update: InstanceUpdate,
    ) -> Result<Option<StateExecutionInstance>> {
        match self
            .inner
            .state_machine
            .transition(instance_id, event, update)
            .await
        {
            Ok(instance) => Ok(Some(instance)),
            Err(err) if err.is_conflict() => {
                debug!(instance_id = %instance_id, event = event.event_type(), "Transition superseded");
                Ok(None)
            }
            Err(err @ StateMachineError::InvalidTransition { .. }) => {
                let current = self.load(instance_id).await?;
                if current.status == ExecutionStatus::Aborting || current.is_terminal() {
                    debug!(
                        instance_id = %instance_id,
                        status = %current.status,
                        event = event.event_type(),
                        "Transition superseded"
                    );
                    Ok(None)
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn definition(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.inner
            .registry
            .get(definition_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(definition_id.to_string()))
    }

    fn resolve_state(&self, instance: &StateExecutionInstance) -> Result<Arc<dyn State>> {
        let definition = self.definition(instance.graph_id())?;
        definition
            .state(&instance.state_name)
            .ok_or_else(|| EngineError::UnknownState {
                workflow: definition.id().to_string(),
                state: instance.state_name.clone(),
            })
    }

    async fn load(&self, instance_id: Uuid) -> Result<StateExecutionInstance> {
        self.inner
            .store
            .get(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Own elements, then each ancestor's, nearest first
    async fn context_for(&self, instance: &StateExecutionInstance) -> Result<ExecutionContext> {
        let mut elements: Vec<ContextElement> = instance.visible_elements().cloned().collect();
        let mut ancestor = instance.parent_instance_id;
        while let Some(ancestor_id) = ancestor {
            let parent = self.load(ancestor_id).await?;
            elements.extend(parent.visible_elements().cloned());
            ancestor = parent.parent_instance_id;
        }

        Ok(ExecutionContext::new(
            instance.clone(),
            elements,
            self.inner.services.clone(),
            self.inner.interrupts.clone(),
            self.inner.config.clone(),
        ))
    }

    fn elapsed(&self, instance: &StateExecutionInstance) -> Duration {
        let since = instance.started_at.unwrap_or(instance.created_at);
        (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
    }
}
