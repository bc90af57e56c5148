//! In-memory saga store for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use walletflow_core::CorrelationId;

use super::store::{SagaInstance, SagaStore, SagaStoreError};

/// Map-backed saga store with version-conditional writes.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    instances: Mutex<HashMap<String, SagaInstance>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    /// Direct read for assertions.
    pub fn get(&self, saga_id: &str) -> Option<SagaInstance> {
        self.instances.lock().unwrap().get(saga_id).cloned()
    }

    /// Seed an instance unconditionally (test arrangement).
    pub fn put(&self, instance: SagaInstance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.saga_id.as_str().to_string(), instance);
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, saga_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        Ok(self.instances.lock().unwrap().get(saga_id.as_str()).cloned())
    }

    async fn save(
        &self,
        instance: &SagaInstance,
        expected_version: i64,
    ) -> Result<(), SagaStoreError> {
        let mut instances = self.instances.lock().unwrap();
        let key = instance.saga_id.as_str().to_string();

        let current_version = instances.get(&key).map_or(0, |i| i.version);
        if current_version != expected_version {
            return Err(SagaStoreError::Conflict {
                saga_id: key,
                expected: expected_version,
            });
        }

        instances.insert(key, instance.clone());
        Ok(())
    }

    async fn list_non_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, SagaStoreError> {
        let instances = self.instances.lock().unwrap();
        let mut stuck: Vec<SagaInstance> = instances
            .values()
            .filter(|i| !i.state.is_terminal() && i.updated_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|i| i.updated_at);
        Ok(stuck)
    }
}
