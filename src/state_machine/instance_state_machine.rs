use super::{
    errors::{StateMachineError, StateMachineResult},
    events::InstanceEvent,
    states::ExecutionStatus,
};
use crate::events::{EngineEvent, EventPublisher};
use crate::models::StateExecutionInstance;
use crate::store::{InstanceStore, InstanceUpdate};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Determine the target status for an event, independent of any instance
pub fn determine_target_state(
    current: ExecutionStatus,
    event: &InstanceEvent,
) -> StateMachineResult<ExecutionStatus> {
    let target = match (current, event) {
        (ExecutionStatus::New, InstanceEvent::Start) => ExecutionStatus::Running,
        (ExecutionStatus::New, InstanceEvent::Skip) => ExecutionStatus::Skipped,
        (
            ExecutionStatus::New,
            InstanceEvent::Fail(status @ (ExecutionStatus::Error | ExecutionStatus::Failed)),
        ) => *status,

        // Suspend and resume stay in RUNNING across the async boundary
        (ExecutionStatus::Running, InstanceEvent::Suspend) => ExecutionStatus::Running,
        (ExecutionStatus::Running, InstanceEvent::Resume) => ExecutionStatus::Running,

        (ExecutionStatus::Running, InstanceEvent::Complete(status)) if status.is_terminal() => {
            *status
        }

        (ExecutionStatus::New | ExecutionStatus::Running, InstanceEvent::Abort) => {
            ExecutionStatus::Aborting
        }
        (ExecutionStatus::Aborting, InstanceEvent::AbortCompleted) => ExecutionStatus::Failed,

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: from_state.to_string(),
                event: describe_event(event),
            })
        }
    };

    Ok(target)
}

fn describe_event(event: &InstanceEvent) -> String {
    match event {
        InstanceEvent::Complete(status) => format!("complete({status})"),
        InstanceEvent::Fail(status) => format!("fail({status})"),
        other => other.event_type().to_string(),
    }
}

/// Applies instance status transitions atomically through an [`InstanceStore`]
#[derive(Clone)]
pub struct InstanceStateMachine {
    store: Arc<dyn InstanceStore>,
    event_publisher: EventPublisher,
}

impl InstanceStateMachine {
    pub fn new(store: Arc<dyn InstanceStore>, event_publisher: EventPublisher) -> Self {
        Self {
            store,
            event_publisher,
        }
    }

    /// Get the current status of an instance
    pub async fn current_state(&self, instance_id: Uuid) -> StateMachineResult<ExecutionStatus> {
        self.store
            .get(instance_id)
            .await?
            .map(|instance| instance.status)
            .ok_or(StateMachineError::InstanceNotFound(instance_id))
    }

    /// Transition the instance on `event`, applying `update` in the same atomic step.
    ///
    /// The store compares the status read here against the persisted one, so two
    /// racing callers cannot both win; the loser gets
    /// [`StateMachineError::ConcurrentTransition`].
    pub async fn transition(
        &self,
        instance_id: Uuid,
        event: InstanceEvent,
        update: InstanceUpdate,
    ) -> StateMachineResult<StateExecutionInstance> {
        let current = self.current_state(instance_id).await?;
        let target = determine_target_state(current, &event)?;

        let updated = self
            .store
            .transition(instance_id, current, target, update)
            .await?;

        let Some(updated) = updated else {
            let actual = self.current_state(instance_id).await?;
            return Err(StateMachineError::ConcurrentTransition {
                instance_id,
                expected: current.to_string(),
                actual: actual.to_string(),
            });
        };

        debug!(
            instance_id = %instance_id,
            state = %updated.state_name,
            from = %current,
            to = %target,
            event = event.event_type(),
            "Instance transitioned"
        );

        self.event_publisher.publish(EngineEvent::InstanceTransitioned {
            instance_id,
            workflow_execution_id: updated.workflow_execution_id.clone(),
            state_name: updated.state_name.clone(),
            from: current,
            to: target,
            event,
        });

        Ok(updated)
    }
}
