//! Typed cross-phase output storage.
//!
//! Values are keyed by (scope, name) where the scope is either the whole workflow
//! execution or one phase of it, and each value has a defined schema.

use super::ServiceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SweepingOutputScope {
    Workflow {
        workflow_execution_id: String,
    },
    Phase {
        workflow_execution_id: String,
        phase_name: String,
    },
}

impl SweepingOutputScope {
    pub fn workflow(workflow_execution_id: impl Into<String>) -> Self {
        Self::Workflow {
            workflow_execution_id: workflow_execution_id.into(),
        }
    }

    pub fn phase(workflow_execution_id: impl Into<String>, phase_name: impl Into<String>) -> Self {
        Self::Phase {
            workflow_execution_id: workflow_execution_id.into(),
            phase_name: phase_name.into(),
        }
    }

    pub fn workflow_execution_id(&self) -> &str {
        match self {
            Self::Workflow {
                workflow_execution_id,
            }
            | Self::Phase {
                workflow_execution_id,
                ..
            } => workflow_execution_id,
        }
    }

    pub fn phase_name(&self) -> Option<&str> {
        match self {
            Self::Workflow { .. } => None,
            Self::Phase { phase_name, .. } => Some(phase_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SweepingOutputKey {
    pub scope: SweepingOutputScope,
    pub name: String,
}

impl SweepingOutputKey {
    pub fn new(scope: SweepingOutputScope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }
}

impl fmt::Display for SweepingOutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope.phase_name() {
            Some(phase) => write!(
                f,
                "{}/{}/{}",
                self.scope.workflow_execution_id(),
                phase,
                self.name
            ),
            None => write!(f, "{}/{}", self.scope.workflow_execution_id(), self.name),
        }
    }
}

/// Marks that a cluster-wide rollback action already ran for the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMarker {
    pub completed: bool,
    pub phase_name: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SweepingOutputValue {
    RollbackMarker(RollbackMarker),
    Json(Value),
}

impl SweepingOutputValue {
    pub fn as_rollback_marker(&self) -> Option<&RollbackMarker> {
        match self {
            Self::RollbackMarker(marker) => Some(marker),
            Self::Json(_) => None,
        }
    }
}

#[async_trait]
pub trait SweepingOutputStore: Send + Sync {
    async fn save(&self, key: SweepingOutputKey, value: SweepingOutputValue) -> ServiceResult<()>;
    async fn find(&self, key: &SweepingOutputKey) -> ServiceResult<Option<SweepingOutputValue>>;
}
