//! Outbox store port.
//!
//! The store participates in the domain's write transaction: a domain
//! change and the events it produced are persisted or rolled back as one
//! unit, and the scheduled dispatcher delivers them afterwards. That split
//! is what lets delivery survive process crashes.
//!
//! Records are never deleted by the event plane; `sent` flips to true only
//! after broker acknowledgement and the row stays for audit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use walletflow_core::{CorrelationId, OutboxRecordId};

/// A record to append, before an id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub event_type: String,
    pub payload: JsonValue,
    pub correlation_id: Option<CorrelationId>,
}

impl NewOutboxRecord {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: OutboxRecordId,
    pub event_type: String,
    pub payload: JsonValue,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub sent: bool,
}

/// Outbox storage failure.
#[derive(Debug, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("outbox record invalid: {0}")]
    InvalidRecord(String),
}

impl OutboxStoreError {
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        Self::Storage {
            operation,
            message: message.to_string(),
        }
    }
}

/// Durable, transaction-participating record of pending events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append one record. An empty `event_type` is rejected; storage
    /// errors propagate so the enclosing domain transaction fails with
    /// them.
    async fn append(&self, record: NewOutboxRecord) -> Result<OutboxRecordId, OutboxStoreError>;

    /// Unsent records, oldest first by id, bounded by `limit`. Stable
    /// under concurrent drainers (row-level reservation where the backend
    /// supports it).
    async fn list_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// Flip `sent` to true. Idempotent; safe to call twice.
    async fn mark_sent(&self, id: OutboxRecordId) -> Result<(), OutboxStoreError>;

    /// Number of unsent records (backlog gauge).
    async fn unsent_count(&self) -> Result<u64, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for std::sync::Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn append(&self, record: NewOutboxRecord) -> Result<OutboxRecordId, OutboxStoreError> {
        (**self).append(record).await
    }

    async fn list_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).list_unsent(limit).await
    }

    async fn mark_sent(&self, id: OutboxRecordId) -> Result<(), OutboxStoreError> {
        (**self).mark_sent(id).await
    }

    async fn unsent_count(&self) -> Result<u64, OutboxStoreError> {
        (**self).unsent_count().await
    }
}
