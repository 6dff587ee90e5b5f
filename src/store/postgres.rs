//! Postgres-backed instance store.
//!
//! Each instance is one row: a JSONB body with the full record plus mirrored
//! columns for lookups. Transitions lock the row with `SELECT ... FOR UPDATE` and
//! only write when the stored status matches the expected one.

use super::{InstanceStore, InstanceUpdate, StoreResult};
use crate::models::StateExecutionInstance;
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// Apply the bundled schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Debug, Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<StateExecutionInstance>> {
        rows.into_iter()
            .map(|row| {
                let body: serde_json::Value = row.try_get("body")?;
                Ok(serde_json::from_value(body)?)
            })
            .collect()
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn insert(&self, instance: StateExecutionInstance) -> StoreResult<()> {
        let body = serde_json::to_value(&instance)?;
        let result = sqlx::query(
            r#"
            INSERT INTO stepwise_instances
                (id, workflow_execution_id, parent_instance_id, state_name, status, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(instance.id)
        .bind(&instance.workflow_execution_id)
        .bind(instance.parent_instance_id)
        .bind(&instance.state_name)
        .bind(instance.status.to_string())
        .bind(body)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(super::StoreError::AlreadyExists(instance.id));
        }
        Ok(())
    }

    async fn get(&self, instance_id: Uuid) -> StoreResult<Option<StateExecutionInstance>> {
        let row = sqlx::query("SELECT body FROM stepwise_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: serde_json::Value = row.try_get("body")?;
                Ok(Some(serde_json::from_value(body)?))
            }
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        instance_id: Uuid,
        expected: ExecutionStatus,
        next: ExecutionStatus,
        update: InstanceUpdate,
    ) -> StoreResult<Option<StateExecutionInstance>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT body FROM stepwise_instances WHERE id = $1 AND status = $2 FOR UPDATE",
        )
        .bind(instance_id)
        .bind(expected.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            debug!(instance_id = %instance_id, expected = %expected, "Transition lost compare-and-set");
            return Ok(None);
        };

        let body: serde_json::Value = row.try_get("body")?;
        let mut instance: StateExecutionInstance = serde_json::from_value(body)?;
        instance.status = next;
        update.apply(&mut instance);

        sqlx::query(
            "UPDATE stepwise_instances SET status = $2, body = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(instance_id)
        .bind(next.to_string())
        .bind(serde_json::to_value(&instance)?)
        .bind(instance.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(instance))
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        let rows = sqlx::query(
            "SELECT body FROM stepwise_instances WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }

    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<StateExecutionInstance>> {
        let rows = sqlx::query(
            "SELECT body FROM stepwise_instances WHERE parent_instance_id = $1 ORDER BY created_at",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }

    async fn by_workflow_execution(
        &self,
        workflow_execution_id: &str,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        let rows = sqlx::query(
            "SELECT body FROM stepwise_instances WHERE workflow_execution_id = $1 ORDER BY created_at",
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }
}
