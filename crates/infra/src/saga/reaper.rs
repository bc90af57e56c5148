//! Saga timeout reaper.
//!
//! A workflow stuck in a non-terminal state longer than the configured
//! timeout receives a synthetic `SAGA_FAILED` through the normal
//! coordinator path, so timeout failure gets the same durability,
//! idempotency and compensation as any other failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use walletflow_events::saga::SagaEventKind;

use crate::outbox::store::OutboxStore;
use crate::saga::coordinator::{SagaCommand, SagaCoordinator, SagaError};
use crate::saga::store::SagaStore;

/// Handle to stop a spawned reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Periodic sweep failing timed-out saga instances.
pub struct SagaReaper<S, O> {
    store: S,
    coordinator: Arc<SagaCoordinator<S, O>>,
    timeout: Duration,
}

impl<S, O> SagaReaper<S, O>
where
    S: SagaStore + Send + Sync + 'static,
    O: OutboxStore + Send + Sync + 'static,
{
    pub fn new(store: S, coordinator: Arc<SagaCoordinator<S, O>>, timeout: Duration) -> Self {
        Self {
            store,
            coordinator,
            timeout,
        }
    }

    /// Spawn the periodic sweep; the cadence is a fraction of the timeout
    /// so a stuck saga is failed at most ~10% late.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let tick = (self.timeout / 10).max(Duration::from_secs(1));

        let join = tokio::spawn(async move {
            info!(
                timeout_secs = self.timeout.as_secs(),
                tick_secs = tick.as_secs(),
                "saga reaper started"
            );
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            error!(error = %err, "reaper sweep failed");
                        }
                    }
                }
            }
            info!("saga reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Fail every instance stuck non-terminal past the timeout. Returns
    /// how many were failed.
    pub async fn sweep_once(&self) -> Result<usize, SagaError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.timeout.as_secs() as i64);
        let stuck = self.store.list_non_terminal_older_than(cutoff).await?;

        let mut reaped = 0;
        for instance in stuck {
            metrics::increment_counter!("saga.timeout");
            warn!(
                saga_id = %instance.saga_id,
                state = %instance.state,
                updated_at = %instance.updated_at,
                "saga timed out; injecting SAGA_FAILED"
            );

            let command = SagaCommand {
                saga_id: Some(instance.saga_id.clone()),
                event: SagaEventKind::SagaFailed,
                // Version-scoped so a repeated sweep over the same stuck
                // revision stays idempotent.
                envelope_id: format!("timeout-{}-v{}", instance.saga_id, instance.version),
            };
            match self.coordinator.submit(command).await {
                Ok(_) => reaped += 1,
                Err(err) => {
                    error!(saga_id = %instance.saga_id, error = %err, "timeout escalation failed");
                }
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use walletflow_core::CorrelationId;
    use walletflow_events::event::event_types;
    use walletflow_events::saga::SagaState;

    use crate::config::SagaConfig;
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use crate::saga::in_memory::InMemorySagaStore;
    use crate::saga::store::SagaInstance;

    #[tokio::test]
    async fn stuck_saga_is_failed_and_compensated() {
        let store = InMemorySagaStore::arc();
        let outbox = InMemoryOutboxStore::arc();
        let coordinator = Arc::new(SagaCoordinator::new(
            store.clone(),
            outbox.clone(),
            SagaConfig::default(),
        ));

        let mut instance = SagaInstance::new(CorrelationId::new("c-6").unwrap());
        instance.state = SagaState::FundsAdded;
        instance.version = 2;
        instance.updated_at = Utc::now() - chrono::Duration::minutes(31);
        store.put(instance);

        let reaper = SagaReaper::new(
            store.clone(),
            coordinator,
            Duration::from_secs(30 * 60),
        );
        let reaped = reaper.sweep_once().await.unwrap();
        assert_eq!(reaped, 1);

        let instance = store.get("c-6").unwrap();
        assert_eq!(instance.state, SagaState::Failed);

        let types: Vec<String> = outbox
            .records()
            .iter()
            .map(|r| r.event_type.clone())
            .collect();
        assert_eq!(
            types,
            vec![
                event_types::REVERSAL_FUNDS_ADDED.to_string(),
                event_types::REVERSAL_CREATED.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn fresh_and_terminal_instances_are_untouched() {
        let store = InMemorySagaStore::arc();
        let outbox = InMemoryOutboxStore::arc();
        let coordinator = Arc::new(SagaCoordinator::new(
            store.clone(),
            outbox.clone(),
            SagaConfig::default(),
        ));

        let mut fresh = SagaInstance::new(CorrelationId::new("c-fresh").unwrap());
        fresh.state = SagaState::WalletCreated;
        fresh.version = 1;
        store.put(fresh);

        let mut done = SagaInstance::new(CorrelationId::new("c-done").unwrap());
        done.state = SagaState::Completed;
        done.version = 5;
        done.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.put(done);

        let reaper = SagaReaper::new(
            store.clone(),
            coordinator,
            Duration::from_secs(30 * 60),
        );
        assert_eq!(reaper.sweep_once().await.unwrap(), 0);
        assert_eq!(store.get("c-fresh").unwrap().state, SagaState::WalletCreated);
        assert_eq!(store.get("c-done").unwrap().state, SagaState::Completed);
        assert!(outbox.records().is_empty());
    }

    #[tokio::test]
    async fn repeated_sweep_over_same_revision_is_idempotent() {
        let store = InMemorySagaStore::arc();
        let outbox = InMemoryOutboxStore::arc();
        let coordinator = Arc::new(SagaCoordinator::new(
            store.clone(),
            outbox.clone(),
            SagaConfig::default(),
        ));

        let mut instance = SagaInstance::new(CorrelationId::new("c-7").unwrap());
        instance.state = SagaState::WalletCreated;
        instance.version = 1;
        instance.updated_at = Utc::now() - chrono::Duration::hours(1);
        store.put(instance);

        let reaper = SagaReaper::new(store.clone(), coordinator, Duration::from_secs(60));
        reaper.sweep_once().await.unwrap();
        let first_compensations = outbox.records().len();

        // Terminal now, so the next sweep sees nothing.
        assert_eq!(reaper.sweep_once().await.unwrap(), 0);
        assert_eq!(outbox.records().len(), first_compensations);
    }
}
