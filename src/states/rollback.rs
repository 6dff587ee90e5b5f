use crate::constants::ROLLBACK_COMPLETED_MARKER;
use crate::context::ExecutionContext;
use crate::error::StateResult;
use crate::services::{RollbackMarker, SweepingOutputKey, SweepingOutputScope, SweepingOutputValue};
use chrono::Utc;
use tracing::info;

/// Guard for cluster-wide rollback actions that must run once per workflow execution
/// no matter how many rollback phases reach them.
///
/// The marker is scoped to the whole workflow execution, never to a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOnce {
    marker: String,
}

impl Default for RollbackOnce {
    fn default() -> Self {
        Self::new(ROLLBACK_COMPLETED_MARKER)
    }
}

impl RollbackOnce {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn key(&self, ctx: &ExecutionContext) -> SweepingOutputKey {
        SweepingOutputKey::new(
            SweepingOutputScope::workflow(ctx.workflow_execution_id()),
            self.marker.clone(),
        )
    }

    pub async fn is_completed(&self, ctx: &ExecutionContext) -> StateResult<bool> {
        let found = ctx.services().sweeping_outputs.find(&self.key(ctx)).await?;
        Ok(found
            .as_ref()
            .and_then(SweepingOutputValue::as_rollback_marker)
            .map(|marker| marker.completed)
            .unwrap_or(false))
    }

    pub async fn mark_completed(&self, ctx: &ExecutionContext) -> StateResult<()> {
        let phase_name = ctx.phase().ok().map(|phase| phase.phase_name.clone());
        ctx.services()
            .sweeping_outputs
            .save(
                self.key(ctx),
                SweepingOutputValue::RollbackMarker(RollbackMarker {
                    completed: true,
                    phase_name: phase_name.clone(),
                    completed_at: Utc::now(),
                }),
            )
            .await?;
        info!(
            workflow_execution_id = %ctx.workflow_execution_id(),
            marker = %self.marker,
            phase = phase_name.as_deref().unwrap_or("-"),
            "Rollback marker recorded"
        );
        Ok(())
    }
}
