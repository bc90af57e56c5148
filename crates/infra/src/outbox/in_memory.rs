//! In-memory outbox store for tests/dev.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use walletflow_core::OutboxRecordId;

use super::store::{NewOutboxRecord, OutboxRecord, OutboxStore, OutboxStoreError};

/// Vec-backed outbox with monotonic ids.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
    next_id: AtomicI64,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn arc() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    /// Snapshot of every record, for assertions.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Record by id, for assertions.
    pub fn record(&self, id: OutboxRecordId) -> Option<OutboxRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: NewOutboxRecord) -> Result<OutboxRecordId, OutboxStoreError> {
        if record.event_type.is_empty() {
            return Err(OutboxStoreError::InvalidRecord(
                "empty event_type".to_string(),
            ));
        }

        let id = OutboxRecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().unwrap().push(OutboxRecord {
            id,
            event_type: record.event_type,
            payload: record.payload,
            correlation_id: record.correlation_id,
            created_at: Utc::now(),
            sent: false,
        });
        Ok(id)
    }

    async fn list_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| !r.sent)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, id: OutboxRecordId) -> Result<(), OutboxStoreError> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            record.sent = true;
        }
        Ok(())
    }

    async fn unsent_count(&self) -> Result<u64, OutboxStoreError> {
        Ok(self.records.lock().unwrap().iter().filter(|r| !r.sent).count() as u64)
    }
}
