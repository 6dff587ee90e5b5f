use super::{InstanceStore, InstanceUpdate, StoreError, StoreResult};
use crate::models::StateExecutionInstance;
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// DashMap-backed store; the compare-and-set runs under the entry's shard lock
///
/// # Example
///
/// ```rust
/// use stepwise_core::models::{StateExecutionInstance, StateType};
/// use stepwise_core::state_machine::ExecutionStatus;
/// use stepwise_core::store::{InMemoryInstanceStore, InstanceStore, InstanceUpdate};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryInstanceStore::new();
/// let instance = StateExecutionInstance::new(
///     "wf-1", "app-1", "acct-1", "deploy", "resize", StateType::ResizeAsg,
/// );
/// let id = instance.id;
/// store.insert(instance).await?;
///
/// let started = store
///     .transition(id, ExecutionStatus::New, ExecutionStatus::Running, InstanceUpdate::new())
///     .await?;
/// assert!(started.is_some());
///
/// // A second writer expecting NEW loses
/// let lost = store
///     .transition(id, ExecutionStatus::New, ExecutionStatus::Running, InstanceUpdate::new())
///     .await?;
/// assert!(lost.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, StateExecutionInstance>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn collect_sorted<F>(&self, predicate: F) -> Vec<StateExecutionInstance>
    where
        F: Fn(&StateExecutionInstance) -> bool,
    {
        let mut matching: Vec<StateExecutionInstance> = self
            .instances
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by_key(|instance| instance.created_at);
        matching
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: StateExecutionInstance) -> StoreResult<()> {
        match self.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(instance.id)),
            Entry::Vacant(vacant) => {
                vacant.insert(instance);
                Ok(())
            }
        }
    }

    async fn get(&self, instance_id: Uuid) -> StoreResult<Option<StateExecutionInstance>> {
        Ok(self
            .instances
            .get(&instance_id)
            .map(|instance| instance.clone()))
    }

    async fn transition(
        &self,
        instance_id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        update: InstanceUpdate,
    ) -> StoreResult<Option<StateExecutionInstance>> {
        let Some(mut instance) = self.instances.get_mut(&instance_id) else {
            return Ok(None);
        };
        if instance.status != expected {
            return Ok(None);
        }
        instance.status = next;
        update.apply(&mut instance);
        Ok(Some(instance.clone()))
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        Ok(self.collect_sorted(|instance| instance.status == status))
    }

    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<StateExecutionInstance>> {
        Ok(self.collect_sorted(|instance| instance.parent_instance_id == Some(parent_id)))
    }

    async fn by_workflow_execution(
        &self,
        workflow_execution_id: &str,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        Ok(self.collect_sorted(|instance| instance.workflow_execution_id == workflow_execution_id))
    }
}
