//! In-memory bus adapter (reference implementation).
//!
//! Semantics match the port contract: per-(destination, group) envelopes
//! are dispatched strictly sequentially by one worker task, subscribers in
//! the same group share the work round-robin, distinct groups each receive
//! every envelope, and an envelope rejected `dlq_attempt_cap` times is
//! routed to `<destination>.dlq`. Publish acknowledges once the envelope
//! is appended to the per-destination log (the adapter's durability
//! point).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use walletflow_events::bus::{
    Acknowledgement, BusError, EnvelopeHandler, MessageBus, dlq_destination,
};
use walletflow_events::envelope::EventEnvelope;

#[derive(Default)]
struct HandlerPool {
    handlers: Mutex<Vec<Arc<dyn EnvelopeHandler>>>,
    cursor: AtomicUsize,
}

impl HandlerPool {
    fn add(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn next(&self) -> Arc<dyn EnvelopeHandler> {
        let handlers = self.handlers.lock().unwrap();
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % handlers.len();
        handlers[index].clone()
    }
}

struct GroupEntry {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    pool: Arc<HandlerPool>,
}

#[derive(Default)]
struct BusInner {
    /// Append-only per-destination log; publish acks against this.
    published: HashMap<String, Vec<EventEnvelope>>,
    /// destination -> group -> worker input.
    groups: HashMap<String, HashMap<String, GroupEntry>>,
}

/// In-memory pub/sub bus with consumer groups and dead-lettering.
pub struct InMemoryBus {
    dlq_attempt_cap: u32,
    inner: Arc<Mutex<BusInner>>,
}

impl InMemoryBus {
    pub fn new(dlq_attempt_cap: u32) -> Self {
        Self {
            dlq_attempt_cap: dlq_attempt_cap.max(1),
            inner: Arc::new(Mutex::new(BusInner::default())),
        }
    }

    pub fn arc(dlq_attempt_cap: u32) -> Arc<Self> {
        Arc::new(Self::new(dlq_attempt_cap))
    }

    /// Everything published to a destination so far (includes `.dlq`
    /// destinations), in publish order.
    pub fn published(&self, destination: &str) -> Vec<EventEnvelope> {
        self.inner
            .lock()
            .unwrap()
            .published
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    pub fn publish_count(&self, destination: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .published
            .get(destination)
            .map_or(0, Vec::len)
    }

    fn deliver(inner: &Mutex<BusInner>, destination: &str, envelope: EventEnvelope) {
        let mut guard = inner.lock().unwrap();
        guard
            .published
            .entry(destination.to_string())
            .or_default()
            .push(envelope.clone());

        if let Some(groups) = guard.groups.get(destination) {
            for entry in groups.values() {
                // A closed worker means the runtime is shutting down.
                let _ = entry.tx.send(envelope.clone());
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, destination: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        Self::deliver(&self.inner, destination, envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), BusError> {
        let mut guard = self.inner.lock().unwrap();
        let groups = guard.groups.entry(destination.to_string()).or_default();

        if let Some(entry) = groups.get(group) {
            // Same group: share the work with the existing worker.
            entry.pool.add(handler);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let pool = Arc::new(HandlerPool::default());
        pool.add(handler);
        groups.insert(
            group.to_string(),
            GroupEntry {
                tx,
                pool: pool.clone(),
            },
        );
        drop(guard);

        let inner = Arc::clone(&self.inner);
        let cap = self.dlq_attempt_cap;
        let dlq = dlq_destination(destination);
        let destination = destination.to_string();
        let group = group.to_string();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let mut attempts = 0u32;
                loop {
                    attempts += 1;
                    match pool.next().handle(envelope.clone()).await {
                        Acknowledgement::Accept => break,
                        Acknowledgement::Reject if attempts >= cap => {
                            warn!(
                                destination = %destination,
                                group = %group,
                                envelope_id = %envelope.id(),
                                attempts,
                                "envelope rejected past attempt cap; dead-lettering"
                            );
                            Self::deliver(&inner, &dlq, envelope);
                            break;
                        }
                        Acknowledgement::Reject => continue,
                    }
                }
            }
        });

        Ok(())
    }
}
