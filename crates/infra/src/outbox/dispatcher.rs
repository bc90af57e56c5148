//! Scheduled outbox dispatcher.
//!
//! One dispatcher task per process drains unsent records on a fixed tick:
//! resolve the binding, wrap the record in an envelope, inject trace
//! context, publish, and mark sent only on broker acknowledgement. Every
//! record is handled independently — no failure aborts a tick — and a
//! failed record is simply re-read on the next tick (implicit, unbounded
//! retry; consumers absorb the resulting duplicates).
//!
//! Within one tick, a publish failure stops further sends to that
//! destination so per-destination id order is preserved; records bound for
//! other destinations continue.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use walletflow_events::binding::BindingRegistry;
use walletflow_events::bus::MessageBus;
use walletflow_events::envelope::EventEnvelope;
use walletflow_observability::TracePropagator;

use crate::config::DispatcherConfig;
use crate::health::HealthState;
use crate::outbox::store::OutboxStore;

/// Per-tick outcome counts, mostly for tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub published: usize,
    pub failed: usize,
    /// Unbound event types (configuration fault, record left untouched).
    pub skipped_unbound: usize,
    /// Records not attempted because an earlier record for the same
    /// destination failed this tick.
    pub deferred: usize,
}

/// Handle to stop a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Periodic worker draining unsent outbox records to the bus.
pub struct OutboxDispatcher<S, B> {
    store: S,
    bus: B,
    registry: Arc<BindingRegistry>,
    config: DispatcherConfig,
    health: HealthState,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: OutboxStore + Send + Sync + 'static,
    B: MessageBus + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        bus: B,
        registry: Arc<BindingRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            config,
            health: HealthState::new(),
        }
    }

    /// Health flag shared with the host's probe.
    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Spawn the periodic drain loop.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let tick = self.config.tick_interval();

        let join = tokio::spawn(async move {
            info!(
                tick_secs = tick.as_secs(),
                batch_size = self.config.batch_size,
                "outbox dispatcher started"
            );
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        let stats = self.run_once().await;
                        debug!(?stats, "outbox tick complete");
                    }
                }
            }
            info!("outbox dispatcher stopped");
        });

        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Drain one batch. Public so tests (and backfills) can tick manually.
    pub async fn run_once(&self) -> TickStats {
        let mut stats = TickStats::default();

        let batch = match self.store.list_unsent(self.config.batch_size).await {
            Ok(batch) => {
                self.health.record_storage_success();
                batch
            }
            Err(err) => {
                error!(error = %err, "outbox drain scan failed");
                self.health.record_storage_failure();
                return stats;
            }
        };

        if let Ok(unsent) = self.store.unsent_count().await {
            metrics::gauge!("outbox.unsent_count", unsent as f64);
        }

        let mut failed_destinations: HashSet<String> = HashSet::new();

        for record in batch {
            let Some(destination) = self.registry.resolve(&record.event_type) else {
                metrics::increment_counter!(
                    "outbox.unknown_type",
                    "event_type" => record.event_type.clone()
                );
                warn!(
                    record_id = %record.id,
                    event_type = %record.event_type,
                    "no binding for event type; record skipped"
                );
                stats.skipped_unbound += 1;
                continue;
            };

            if failed_destinations.contains(destination) {
                stats.deferred += 1;
                continue;
            }

            let mut envelope = EventEnvelope::new(
                record.id.to_string(),
                record.event_type.as_str(),
                self.config.source_uri.as_str(),
                record.payload.clone(),
            );
            if let Some(correlation) = &record.correlation_id {
                envelope.set_correlation_id(correlation.as_str());
            }
            TracePropagator::inject(&mut envelope);

            match self.bus.publish(destination, envelope).await {
                Ok(()) => {
                    metrics::increment_counter!(
                        "outbox.sent",
                        "binding" => destination.to_string()
                    );
                    stats.published += 1;
                    if let Err(err) = self.store.mark_sent(record.id).await {
                        // The record stays visible to the next scan; the
                        // resulting re-publish is within at-least-once.
                        warn!(
                            record_id = %record.id,
                            error = %err,
                            "mark_sent failed; record will be re-published"
                        );
                    }
                }
                Err(err) => {
                    metrics::increment_counter!(
                        "outbox.send_failed",
                        "binding" => destination.to_string()
                    );
                    warn!(
                        record_id = %record.id,
                        destination = %destination,
                        error = %err,
                        "publish failed; record left unsent"
                    );
                    stats.failed += 1;
                    failed_destinations.insert(destination.to_string());
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use walletflow_events::bus::{BusError, EnvelopeHandler};
    use walletflow_events::event::event_types;

    use crate::health::DEGRADED_AFTER;
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use crate::outbox::store::{NewOutboxRecord, OutboxStoreError};

    /// Bus double recording publishes; fails calls whose index is listed.
    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, EventEnvelope)>>,
        fail_calls: Vec<usize>,
        calls: AtomicUsize,
    }

    impl RecordingBus {
        fn failing_on(fail_calls: Vec<usize>) -> Self {
            Self {
                fail_calls,
                ..Self::default()
            }
        }

        fn published(&self) -> Vec<(String, EventEnvelope)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(
            &self,
            destination: &str,
            envelope: EventEnvelope,
        ) -> Result<(), BusError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_calls.contains(&call) {
                return Err(BusError::publish(destination, "broker unavailable"));
            }
            self.published
                .lock()
                .unwrap()
                .push((destination.to_string(), envelope));
            Ok(())
        }

        async fn subscribe(
            &self,
            _destination: &str,
            _group: &str,
            _handler: std::sync::Arc<dyn EnvelopeHandler>,
        ) -> Result<(), BusError> {
            Ok(())
        }
    }

    /// Store wrapper whose list_unsent always fails.
    struct BrokenStore;

    #[async_trait]
    impl OutboxStore for BrokenStore {
        async fn append(
            &self,
            _record: NewOutboxRecord,
        ) -> Result<walletflow_core::OutboxRecordId, OutboxStoreError> {
            Err(OutboxStoreError::storage("append", "down"))
        }

        async fn list_unsent(
            &self,
            _limit: u32,
        ) -> Result<Vec<crate::outbox::store::OutboxRecord>, OutboxStoreError> {
            Err(OutboxStoreError::storage("list_unsent", "down"))
        }

        async fn mark_sent(
            &self,
            _id: walletflow_core::OutboxRecordId,
        ) -> Result<(), OutboxStoreError> {
            Err(OutboxStoreError::storage("mark_sent", "down"))
        }

        async fn unsent_count(&self) -> Result<u64, OutboxStoreError> {
            Err(OutboxStoreError::storage("unsent_count", "down"))
        }
    }

    fn dispatcher<S: OutboxStore + Send + Sync + 'static>(
        store: S,
        bus: Arc<RecordingBus>,
    ) -> OutboxDispatcher<S, Arc<RecordingBus>> {
        OutboxDispatcher::new(
            store,
            bus,
            Arc::new(BindingRegistry::wallet_defaults()),
            DispatcherConfig::default().with_batch_size(10),
        )
    }

    async fn append(store: &InMemoryOutboxStore, event_type: &str) {
        store
            .append(NewOutboxRecord::new(event_type, json!({"amount": 1})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drains_and_marks_sent_with_no_second_publish() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = dispatcher(store.clone(), bus.clone());

        append(&store, event_types::WALLET_CREATED).await;
        let stats = dispatcher.run_once().await;
        assert_eq!(stats.published, 1);

        // Second tick: the record is already sent, nothing is re-published.
        let stats = dispatcher.run_once().await;
        assert_eq!(stats, TickStats::default());
        assert_eq!(bus.published().len(), 1);
        assert!(store.records()[0].sent);
    }

    #[tokio::test]
    async fn envelope_carries_record_identity_and_trace_stamp() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = dispatcher(store.clone(), bus.clone());

        store
            .append(
                NewOutboxRecord::new(event_types::FUNDS_ADDED, json!({"amount": 100}))
                    .with_correlation(walletflow_core::CorrelationId::new("c-1").unwrap()),
            )
            .await
            .unwrap();
        dispatcher.run_once().await;

        let (destination, envelope) = &bus.published()[0];
        assert_eq!(destination, "funds-added");
        assert_eq!(envelope.event_type(), event_types::FUNDS_ADDED);
        assert_eq!(envelope.source(), "urn:walletflow:outbox");
        assert_eq!(envelope.correlation_id(), Some("c-1"));
        assert_eq!(envelope.id(), store.records()[0].id.to_string());
        assert!(envelope.send_timestamp().is_some());
        assert!(envelope.validate().is_ok());
    }

    #[tokio::test]
    async fn unbound_type_is_skipped_without_touching_the_record() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = dispatcher(store.clone(), bus.clone());

        append(&store, "wallet.renamed").await;
        let stats = dispatcher.run_once().await;

        assert_eq!(stats.skipped_unbound, 1);
        assert!(bus.published().is_empty());
        // Not sent, not deleted: the record waits for a registry fix.
        assert!(!store.records()[0].sent);
    }

    #[tokio::test]
    async fn publish_failure_defers_same_destination_but_not_others() {
        let store = InMemoryOutboxStore::arc();
        // Call 1 (second record overall) fails.
        let bus = Arc::new(RecordingBus::failing_on(vec![1]));
        let dispatcher = dispatcher(store.clone(), bus.clone());

        append(&store, event_types::WALLET_CREATED).await;
        append(&store, event_types::WALLET_CREATED).await;
        append(&store, event_types::WALLET_CREATED).await;
        append(&store, event_types::FUNDS_ADDED).await;

        let stats = dispatcher.run_once().await;
        assert_eq!(stats.published, 2); // first wallet-created + funds-added
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.deferred, 1); // third wallet-created held back

        let records = store.records();
        assert!(records[0].sent);
        assert!(!records[1].sent);
        assert!(!records[2].sent);
        assert!(records[3].sent);

        // Next tick retries the remainder in id order.
        let stats = dispatcher.run_once().await;
        assert_eq!(stats.published, 2);
        assert!(store.records().iter().all(|r| r.sent));

        let wallet_created: Vec<_> = bus
            .published()
            .iter()
            .filter(|(d, _)| d == "wallet-created")
            .map(|(_, e)| e.id().to_string())
            .collect();
        let mut sorted = wallet_created.clone();
        sorted.sort();
        assert_eq!(wallet_created, sorted, "per-destination id order");
    }

    #[tokio::test]
    async fn repeated_scan_failures_degrade_health() {
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = dispatcher(BrokenStore, bus);
        let health = dispatcher.health();

        for _ in 0..DEGRADED_AFTER {
            dispatcher.run_once().await;
        }
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn spawned_dispatcher_shuts_down_cleanly() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(RecordingBus::default());
        append(&store, event_types::WALLET_CREATED).await;

        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            bus.clone(),
            Arc::new(BindingRegistry::wallet_defaults()),
            DispatcherConfig::default()
                .with_tick_interval_secs(1)
                .with_batch_size(10),
        );
        let handle = dispatcher.spawn();

        // First interval tick fires immediately.
        for _ in 0..50 {
            if !bus.published().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert_eq!(bus.published().len(), 1);
    }
}
