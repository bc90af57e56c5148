//! Saga instance model and the minimal durable interface the coordinator
//! depends on.
//!
//! The coordinator owns all behavior; a store only loads instances and
//! writes them back conditionally on the version it read (optimistic
//! concurrency). Terminal instances are retained, never destroyed.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use walletflow_core::CorrelationId;
use walletflow_events::saga::SagaState;

/// Bound on the per-instance set of applied envelope ids. Old entries age
/// out FIFO; at-least-once delivery makes very late duplicates harmless
/// because they hit the invalid-transition path instead.
pub const PROCESSED_IDS_CAP: usize = 256;

/// Durable state of one workflow, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: CorrelationId,
    pub state: SagaState,
    /// Monotonic revision; `(saga_id, version)` identifies one successful
    /// mutation.
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_event_type: Option<String>,
    /// Envelope ids already applied, oldest first, bounded by
    /// [`PROCESSED_IDS_CAP`].
    pub processed_event_ids: VecDeque<String>,
}

impl SagaInstance {
    pub fn new(saga_id: CorrelationId) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            state: SagaState::Initial,
            version: 0,
            started_at: now,
            updated_at: now,
            last_event_type: None,
            processed_event_ids: VecDeque::new(),
        }
    }

    pub fn has_processed(&self, envelope_id: &str) -> bool {
        self.processed_event_ids.iter().any(|id| id == envelope_id)
    }

    pub fn record_processed(&mut self, envelope_id: String) {
        self.processed_event_ids.push_back(envelope_id);
        while self.processed_event_ids.len() > PROCESSED_IDS_CAP {
            self.processed_event_ids.pop_front();
        }
    }
}

/// Saga storage failure.
#[derive(Debug, thiserror::Error)]
pub enum SagaStoreError {
    /// The version-conditional write lost a race; re-read and retry.
    #[error("stale version for saga '{saga_id}': expected {expected}")]
    Conflict { saga_id: String, expected: i64 },

    #[error("saga storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("saga state serialization failed: {0}")]
    Serialization(String),
}

impl SagaStoreError {
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        Self::Storage {
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaStoreError::Conflict { .. })
    }
}

/// Minimal durable interface for saga state.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn load(&self, saga_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError>;

    /// Persist `instance`, conditional on the stored version still being
    /// `expected_version` (0 means "must not exist yet"). A lost race
    /// yields [`SagaStoreError::Conflict`].
    async fn save(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
    ) -> Result<(), SagaStoreError>;

    /// Non-terminal instances whose `updated_at` is older than `cutoff`
    /// (reaper scan).
    async fn list_non_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, SagaStoreError>;
}

#[async_trait]
impl<S> SagaStore for std::sync::Arc<S>
where
    S: SagaStore + ?Sized,
{
    async fn load(&self, saga_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        (**self).load(saga_id).await
    }

    async fn save(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
    ) -> Result<(), SagaStoreError> {
        (**self).save(instance, expected_version).await
    }

    async fn list_non_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, SagaStoreError> {
        (**self).list_non_terminal_older_than(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_ids_age_out_fifo() {
        let mut instance = SagaInstance::new(CorrelationId::new("c-1").unwrap());
        for i in 0..PROCESSED_IDS_CAP + 10 {
            instance.record_processed(format!("e-{i}"));
        }
        assert_eq!(instance.processed_event_ids.len(), PROCESSED_IDS_CAP);
        assert!(!instance.has_processed("e-0"));
        assert!(instance.has_processed(&format!("e-{}", PROCESSED_IDS_CAP + 9)));
    }
}
