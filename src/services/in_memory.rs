//! In-memory collaborators for tests and embedding.

use super::sweeping_output::{SweepingOutputKey, SweepingOutputStore, SweepingOutputValue};
use super::{
    ActivityLog, CloudProviderConfig, InfrastructureLookup, InfrastructureMapping, NewActivity,
    SecretResolver, ServiceError, ServiceResult, SettingsLookup,
};
use crate::models::EncryptionDetails;
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryInfrastructureLookup {
    mappings: DashMap<(String, String), InfrastructureMapping>,
}

impl InMemoryInfrastructureLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mapping: InfrastructureMapping) {
        self.mappings
            .insert((mapping.app_id.clone(), mapping.id.clone()), mapping);
    }
}

#[async_trait]
impl InfrastructureLookup for InMemoryInfrastructureLookup {
    async fn get(
        &self,
        app_id: &str,
        infra_mapping_id: &str,
    ) -> ServiceResult<InfrastructureMapping> {
        self.mappings
            .get(&(app_id.to_string(), infra_mapping_id.to_string()))
            .map(|mapping| mapping.clone())
            .ok_or_else(|| ServiceError::not_found("infrastructure mapping", infra_mapping_id))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsLookup {
    settings: DashMap<String, CloudProviderConfig>,
}

impl InMemorySettingsLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: CloudProviderConfig) {
        self.settings.insert(config.setting_id.clone(), config);
    }
}

#[async_trait]
impl SettingsLookup for InMemorySettingsLookup {
    async fn get(&self, setting_id: &str) -> ServiceResult<CloudProviderConfig> {
        self.settings
            .get(setting_id)
            .map(|config| config.clone())
            .ok_or_else(|| ServiceError::not_found("setting", setting_id))
    }
}

/// Resolves every setting to a reference naming it; no real secrets involved
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticSecretResolver;

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn get_encryption_details(
        &self,
        config: &CloudProviderConfig,
        app_id: &str,
        workflow_execution_id: &str,
    ) -> ServiceResult<EncryptionDetails> {
        Ok(EncryptionDetails {
            secret_ref: format!("{}/{}", config.provider, config.setting_id),
            payload: json!({
                "app_id": app_id,
                "workflow_execution_id": workflow_execution_id,
            }),
        })
    }
}

/// Activity record as tracked in memory
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub id: String,
    pub activity: NewActivity,
    pub status: ExecutionStatus,
    pub status_history: Vec<ExecutionStatus>,
}

#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    activities: RwLock<Vec<ActivityRecord>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, activity_id: &str) -> Option<ActivityRecord> {
        self.activities
            .read()
            .iter()
            .find(|record| record.id == activity_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<ActivityRecord> {
        self.activities.read().clone()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn create(&self, activity: NewActivity) -> ServiceResult<String> {
        let id = Uuid::new_v4().to_string();
        self.activities.write().push(ActivityRecord {
            id: id.clone(),
            activity,
            status: ExecutionStatus::Running,
            status_history: vec![ExecutionStatus::Running],
        });
        Ok(id)
    }

    async fn update_status(&self, activity_id: &str, status: ExecutionStatus) -> ServiceResult<()> {
        let mut activities = self.activities.write();
        let record = activities
            .iter_mut()
            .find(|record| record.id == activity_id)
            .ok_or_else(|| ServiceError::not_found("activity", activity_id))?;
        record.status = status;
        record.status_history.push(status);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySweepingOutputStore {
    outputs: DashMap<SweepingOutputKey, SweepingOutputValue>,
}

impl InMemorySweepingOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[async_trait]
impl SweepingOutputStore for InMemorySweepingOutputStore {
    async fn save(&self, key: SweepingOutputKey, value: SweepingOutputValue) -> ServiceResult<()> {
        self.outputs.insert(key, value);
        Ok(())
    }

    async fn find(&self, key: &SweepingOutputKey) -> ServiceResult<Option<SweepingOutputValue>> {
        Ok(self.outputs.get(key).map(|value| value.clone()))
    }
}
