//! # Collaborator Interfaces
//!
//! Narrow async traits the engine consumes for everything outside its core:
//! deployment target lookup, cloud provider settings, secret resolution, the
//! activity audit trail and cross-phase output storage. In-memory implementations
//! ship in [`in_memory`]; Postgres-backed storage in `postgres` behind the
//! `postgres` feature.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sweeping_output;

use crate::dispatch::RemoteTaskDispatcher;
use crate::models::EncryptionDetails;
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub use in_memory::{
    InMemoryActivityLog, InMemoryInfrastructureLookup, InMemorySettingsLookup,
    InMemorySweepingOutputStore, StaticSecretResolver,
};
pub use sweeping_output::{
    RollbackMarker, SweepingOutputKey, SweepingOutputScope, SweepingOutputStore,
    SweepingOutputValue,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("No {kind} found with id '{id}'")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid collaborator data: {0}")]
    Invalid(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Resolved deployment target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureMapping {
    pub id: String,
    pub app_id: String,
    pub env_id: String,
    pub service_id: String,
    pub compute_provider_setting_id: String,
    pub region: Option<String>,
    pub cluster_name: Option<String>,
    pub deployment_type: String,
}

/// Cloud provider credentials and configuration blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    pub setting_id: String,
    pub provider: String,
    #[serde(default)]
    pub config: Value,
}

/// Audit record created for each remote-call state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    pub app_id: String,
    pub env_id: Option<String>,
    pub workflow_execution_id: String,
    pub state_name: String,
    pub command_name: String,
    pub command_type: String,
}

#[async_trait]
pub trait InfrastructureLookup: Send + Sync {
    async fn get(&self, app_id: &str, infra_mapping_id: &str)
        -> ServiceResult<InfrastructureMapping>;
}

#[async_trait]
pub trait SettingsLookup: Send + Sync {
    async fn get(&self, setting_id: &str) -> ServiceResult<CloudProviderConfig>;
}

/// Resolves credentials for a task. The result is passed opaquely and never logged.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn get_encryption_details(
        &self,
        config: &CloudProviderConfig,
        app_id: &str,
        workflow_execution_id: &str,
    ) -> ServiceResult<EncryptionDetails>;
}

/// Audit trail. Fire-and-forget from the engine's perspective.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn create(&self, activity: NewActivity) -> ServiceResult<String>;
    async fn update_status(&self, activity_id: &str, status: ExecutionStatus) -> ServiceResult<()>;
}

/// Collaborators handed to every state invocation
#[derive(Clone)]
pub struct StateServices {
    pub infrastructure: Arc<dyn InfrastructureLookup>,
    pub settings: Arc<dyn SettingsLookup>,
    pub secrets: Arc<dyn SecretResolver>,
    pub activities: Arc<dyn ActivityLog>,
    pub sweeping_outputs: Arc<dyn SweepingOutputStore>,
    pub dispatcher: Arc<dyn RemoteTaskDispatcher>,
}

impl std::fmt::Debug for StateServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateServices").finish_non_exhaustive()
    }
}
