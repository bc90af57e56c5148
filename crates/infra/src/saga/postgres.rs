//! Postgres-backed saga store.
//!
//! One row per saga instance. Writes are version-conditional: an insert
//! expects the row to be absent (expected version 0), an update matches
//! the previously read version in the WHERE clause; zero affected rows in
//! either case means a concurrent writer won and surfaces as
//! [`SagaStoreError::Conflict`] for the coordinator's retry loop.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use walletflow_core::CorrelationId;
use walletflow_events::saga::SagaState;

use super::store::{SagaInstance, SagaStore, SagaStoreError};

#[derive(Debug, Clone)]
pub struct PostgresSagaStore {
    pool: Arc<PgPool>,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[instrument(skip(self), fields(saga_id = %saga_id), err)]
    async fn load(&self, saga_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, state, version, started_at, updated_at,
                   last_event_type, processed_event_ids
            FROM saga_instances
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|row| instance_from_row(&row)).transpose()
    }

    #[instrument(
        skip(self, instance),
        fields(saga_id = %instance.saga_id, state = %instance.state, expected_version),
        err
    )]
    async fn save(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
    ) -> Result<(), SagaStoreError> {
        let processed = serde_json::to_value(&instance.processed_event_ids)
            .map_err(|e| SagaStoreError::Serialization(e.to_string()))?;

        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (saga_id, state, version, started_at, updated_at,
                     last_event_type, processed_event_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(instance.saga_id.as_str())
            .bind(instance.state.as_str())
            .bind(instance.version)
            .bind(instance.started_at)
            .bind(instance.updated_at)
            .bind(instance.last_event_type.as_deref())
            .bind(&processed)
            .execute(&*self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET state = $2,
                    version = $3,
                    updated_at = $4,
                    last_event_type = $5,
                    processed_event_ids = $6
                WHERE saga_id = $1 AND version = $7
                "#,
            )
            .bind(instance.saga_id.as_str())
            .bind(instance.state.as_str())
            .bind(instance.version)
            .bind(instance.updated_at)
            .bind(instance.last_event_type.as_deref())
            .bind(&processed)
            .bind(expected_version)
            .execute(&*self.pool)
            .await
        };

        let result = result.map_err(|e| map_sqlx_error("save", e))?;
        if result.rows_affected() != 1 {
            return Err(SagaStoreError::Conflict {
                saga_id: instance.saga_id.as_str().to_string(),
                expected: expected_version,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_non_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, SagaStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, state, version, started_at, updated_at,
                   last_event_type, processed_event_ids
            FROM saga_instances
            WHERE state NOT IN ('COMPLETED', 'FAILED') AND updated_at < $1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_non_terminal_older_than", e))?;

        rows.iter().map(instance_from_row).collect()
    }
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<SagaInstance, SagaStoreError> {
    let saga_id: String = row
        .try_get("saga_id")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let state: String = row
        .try_get("state")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let started_at: DateTime<Utc> = row
        .try_get("started_at")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let updated_at: DateTime<Utc> = row
        .try_get("updated_at")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let last_event_type: Option<String> = row
        .try_get("last_event_type")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let processed: serde_json::Value = row
        .try_get("processed_event_ids")
        .map_err(|e| map_sqlx_error("decode_row", e))?;

    let saga_id =
        CorrelationId::new(saga_id).map_err(|e| SagaStoreError::Serialization(e.to_string()))?;
    let state: SagaState = state
        .parse()
        .map_err(|e: String| SagaStoreError::Serialization(e))?;
    let processed_event_ids: VecDeque<String> = serde_json::from_value(processed)
        .map_err(|e| SagaStoreError::Serialization(e.to_string()))?;

    Ok(SagaInstance {
        saga_id,
        state,
        version,
        started_at,
        updated_at,
        last_event_type,
        processed_event_ids,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> SagaStoreError {
    match err {
        sqlx::Error::Database(db_err) => SagaStoreError::storage(operation, db_err.message()),
        sqlx::Error::PoolClosed => SagaStoreError::storage(operation, "connection pool closed"),
        other => SagaStoreError::storage(operation, other),
    }
}
