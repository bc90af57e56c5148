//! Postgres-backed outbox store.
//!
//! ## Transactional coupling
//!
//! `append_in_tx` and `flush` insert into the caller's open transaction:
//! the record becomes visible to `list_unsent` only after the domain
//! transaction commits, and rolls back with it. The trait-level `append`
//! is a convenience for producers without a surrounding transaction (one
//! insert is already atomic).
//!
//! ## Drain scans
//!
//! `list_unsent` reads with `FOR UPDATE SKIP LOCKED`, so a second drainer
//! sees disjoint rows instead of colliding; the reservation is released
//! when the scan's transaction ends. A single-dispatcher deployment sees
//! pure id order.
//!
//! ## Error mapping
//!
//! SQLx errors map onto [`OutboxStoreError::Storage`] with the failing
//! operation named; there is no concurrency case here because `mark_sent`
//! is an idempotent flag flip.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use walletflow_core::{CorrelationId, OutboxRecordId};
use walletflow_events::collector::EventCollector;

use super::store::{NewOutboxRecord, OutboxRecord, OutboxStore, OutboxStoreError};

/// Postgres outbox store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Append a record inside the caller's open transaction.
    #[instrument(skip(self, tx, record), fields(event_type = %record.event_type), err)]
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &NewOutboxRecord,
    ) -> Result<OutboxRecordId, OutboxStoreError> {
        validate(record)?;

        let row = sqlx::query(
            r#"
            INSERT INTO outbox_records (event_type, payload, correlation_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.correlation_id.as_ref().map(CorrelationId::as_str))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_in_tx", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("append_in_tx", e))?;
        Ok(OutboxRecordId::new(id))
    }

    /// Drain a unit-of-work collector into the caller's transaction.
    ///
    /// All pending events commit or roll back together with the domain
    /// change that produced them.
    pub async fn flush(
        &self,
        collector: &mut EventCollector,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<OutboxRecordId>, OutboxStoreError> {
        let pending = collector.drain();
        let mut ids = Vec::with_capacity(pending.len());
        for event in pending {
            let record = NewOutboxRecord {
                event_type: event.event_type,
                payload: event.payload,
                correlation_id: event.correlation_id,
            };
            ids.push(self.append_in_tx(tx, &record).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<OutboxRecordId, OutboxStoreError> {
        validate(&record)?;

        let row = sqlx::query(
            r#"
            INSERT INTO outbox_records (event_type, payload, correlation_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.correlation_id.as_ref().map(CorrelationId::as_str))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("append", e))?;
        Ok(OutboxRecordId::new(id))
    }

    #[instrument(skip(self), err)]
    async fn list_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("list_unsent", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, correlation_id, created_at, sent
            FROM outbox_records
            WHERE sent = FALSE
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_unsent", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("list_unsent", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn mark_sent(&self, id: OutboxRecordId) -> Result<(), OutboxStoreError> {
        sqlx::query("UPDATE outbox_records SET sent = TRUE WHERE id = $1")
            .bind(id.value())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?;
        Ok(())
    }

    async fn unsent_count(&self) -> Result<u64, OutboxStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS unsent FROM outbox_records WHERE sent = FALSE")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("unsent_count", e))?;

        let count: i64 = row
            .try_get("unsent")
            .map_err(|e| map_sqlx_error("unsent_count", e))?;
        Ok(count.max(0) as u64)
    }
}

fn validate(record: &NewOutboxRecord) -> Result<(), OutboxStoreError> {
    if record.event_type.is_empty() {
        return Err(OutboxStoreError::InvalidRecord(
            "empty event_type".to_string(),
        ));
    }
    Ok(())
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxStoreError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let event_type: String = row
        .try_get("event_type")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let correlation_id: Option<String> = row
        .try_get("correlation_id")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let sent: bool = row
        .try_get("sent")
        .map_err(|e| map_sqlx_error("decode_row", e))?;

    let correlation_id = correlation_id
        .map(CorrelationId::new)
        .transpose()
        .map_err(|e| OutboxStoreError::InvalidRecord(e.to_string()))?;

    Ok(OutboxRecord {
        id: OutboxRecordId::new(id),
        event_type,
        payload,
        correlation_id,
        created_at,
        sent,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => OutboxStoreError::storage(operation, db_err.message()),
        sqlx::Error::PoolClosed => OutboxStoreError::storage(operation, "connection pool closed"),
        other => OutboxStoreError::storage(operation, other),
    }
}
