//! Postgres-backed sweeping output storage. Shares the schema applied by
//! [`crate::store::postgres::run_migrations`].

use super::sweeping_output::{SweepingOutputKey, SweepingOutputStore, SweepingOutputValue};
use super::{ServiceError, ServiceResult};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PgSweepingOutputStore {
    pool: PgPool,
}

impl PgSweepingOutputStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn phase_column(key: &SweepingOutputKey) -> &str {
    key.scope.phase_name().unwrap_or("")
}

#[async_trait]
impl SweepingOutputStore for PgSweepingOutputStore {
    async fn save(&self, key: SweepingOutputKey, value: SweepingOutputValue) -> ServiceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stepwise_sweeping_outputs (workflow_execution_id, phase_name, name, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_execution_id, phase_name, name)
            DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key.scope.workflow_execution_id())
        .bind(phase_column(&key))
        .bind(&key.name)
        .bind(serde_json::to_value(&value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, key: &SweepingOutputKey) -> ServiceResult<Option<SweepingOutputValue>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM stepwise_sweeping_outputs
            WHERE workflow_execution_id = $1 AND phase_name = $2 AND name = $3
            "#,
        )
        .bind(key.scope.workflow_execution_id())
        .bind(phase_column(key))
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("value")?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }
}
