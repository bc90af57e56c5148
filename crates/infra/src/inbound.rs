//! Inbound dispatcher: routes bus-delivered envelopes to the saga.
//!
//! Per envelope: extract trace context and parent a handler span from it,
//! require a correlation id, decode the payload against the declared
//! type, and submit the mapped event to the coordinator. Positive ack
//! only after the coordinator has durably recorded the transition or
//! deterministically rejected it (duplicate, invalid transition) — both
//! mean the envelope needs no redelivery.
//!
//! An envelope without a correlation id belongs to no workflow: the
//! coordinator is told `SAGA_FAILED` (which it can only log — there is no
//! instance) and the envelope is positively acked. A payload that fails to
//! decode is rejected so the bus can dead-letter it after its attempt cap.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, warn};

use walletflow_core::CorrelationId;
use walletflow_events::binding::BindingRegistry;
use walletflow_events::bus::{Acknowledgement, BusError, EnvelopeHandler, MessageBus};
use walletflow_events::envelope::EventEnvelope;
use walletflow_events::event::{DomainEvent, event_types};
use walletflow_events::saga::{SagaEventKind, saga_event_for_type};
use walletflow_observability::TracePropagator;

use crate::outbox::store::OutboxStore;
use crate::saga::coordinator::{SagaCommand, SagaCoordinator};
use crate::saga::store::SagaStore;

/// Consumer group under which the saga consumes the forward destinations.
pub const SAGA_CONSUMER_GROUP: &str = "wallet-saga";

/// Bus-facing adapter in front of the saga coordinator.
pub struct InboundDispatcher<S, O> {
    coordinator: Arc<SagaCoordinator<S, O>>,
}

impl<S, O> InboundDispatcher<S, O>
where
    S: SagaStore + Send + Sync + 'static,
    O: OutboxStore + Send + Sync + 'static,
{
    pub fn new(coordinator: Arc<SagaCoordinator<S, O>>) -> Self {
        Self { coordinator }
    }

    async fn process(&self, envelope: EventEnvelope) -> Acknowledgement {
        let saga_id = envelope
            .correlation_id()
            .and_then(|raw| CorrelationId::new(raw).ok());

        let Some(saga_id) = saga_id else {
            warn!(
                envelope_id = %envelope.id(),
                event_type = %envelope.event_type(),
                "envelope without usable correlation id; failing its workflow"
            );
            // Nothing more can be done for this delivery; handled.
            let _ = self
                .coordinator
                .submit(SagaCommand {
                    saga_id: None,
                    event: SagaEventKind::SagaFailed,
                    envelope_id: envelope.id().to_string(),
                })
                .await;
            return Acknowledgement::Accept;
        };

        let Some(event) = saga_event_for_type(envelope.event_type()) else {
            metrics::increment_counter!(
                "inbound.decode_failed",
                "event_type" => envelope.event_type().to_string()
            );
            warn!(
                envelope_id = %envelope.id(),
                event_type = %envelope.event_type(),
                "envelope type not routable to the saga; rejecting"
            );
            return Acknowledgement::Reject;
        };

        if let Err(err) = DomainEvent::from_payload(envelope.event_type(), envelope.data()) {
            metrics::increment_counter!(
                "inbound.decode_failed",
                "event_type" => envelope.event_type().to_string()
            );
            warn!(
                envelope_id = %envelope.id(),
                event_type = %envelope.event_type(),
                error = %err,
                "envelope payload failed to decode; rejecting"
            );
            return Acknowledgement::Reject;
        }

        let command = SagaCommand {
            saga_id: Some(saga_id),
            event,
            envelope_id: envelope.id().to_string(),
        };
        match self.coordinator.submit(command).await {
            // Applied, Duplicate and InvalidTransition are all final for
            // this envelope.
            Ok(_) => Acknowledgement::Accept,
            Err(err) => {
                warn!(
                    envelope_id = %envelope.id(),
                    error = %err,
                    "saga command not durably recorded; requesting redelivery"
                );
                Acknowledgement::Reject
            }
        }
    }
}

#[async_trait]
impl<S, O> EnvelopeHandler for InboundDispatcher<S, O>
where
    S: SagaStore + Send + Sync + 'static,
    O: OutboxStore + Send + Sync + 'static,
{
    async fn handle(&self, envelope: EventEnvelope) -> Acknowledgement {
        let extracted = TracePropagator::extract(&envelope);
        let span = tracing::info_span!(
            "inbound_envelope",
            envelope_id = %envelope.id(),
            event_type = %envelope.event_type(),
            lag_ms = extracted.lag_ms,
        );
        extracted.parent_span(&span);

        self.process(envelope).instrument(span).await
    }
}

/// Subscribe `handler` to the four forward wallet destinations under the
/// saga consumer group.
pub async fn subscribe_forward<B: MessageBus>(
    bus: &B,
    registry: &BindingRegistry,
    handler: Arc<dyn EnvelopeHandler>,
) -> Result<(), BusError> {
    for event_type in [
        event_types::WALLET_CREATED,
        event_types::FUNDS_ADDED,
        event_types::FUNDS_WITHDRAWN,
        event_types::FUNDS_TRANSFERRED,
    ] {
        let Some(destination) = registry.resolve(event_type) else {
            return Err(BusError::subscribe(event_type, "event type has no binding"));
        };
        bus.subscribe(destination, SAGA_CONSUMER_GROUP, handler.clone())
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use walletflow_core::WalletId;
    use walletflow_events::event::WalletEvent;
    use walletflow_events::saga::SagaState;

    use crate::config::SagaConfig;
    use crate::outbox::in_memory::InMemoryOutboxStore;
    use crate::saga::in_memory::InMemorySagaStore;

    fn handler(
        store: Arc<InMemorySagaStore>,
    ) -> InboundDispatcher<Arc<InMemorySagaStore>, Arc<InMemoryOutboxStore>> {
        let coordinator = Arc::new(SagaCoordinator::new(
            store,
            InMemoryOutboxStore::arc(),
            SagaConfig::default(),
        ));
        InboundDispatcher::new(coordinator)
    }

    fn wallet_created_envelope(id: &str, correlation: Option<&str>) -> EventEnvelope {
        let correlation_id = correlation.map(|c| CorrelationId::new(c).unwrap());
        let event = DomainEvent::new(
            WalletEvent::WalletCreated {
                wallet_id: WalletId::new(),
            },
            correlation_id,
        );
        let mut envelope = EventEnvelope::new(
            id,
            event_types::WALLET_CREATED,
            "urn:walletflow:outbox",
            event.to_payload(),
        );
        if let Some(c) = correlation {
            envelope.set_correlation_id(c);
        }
        envelope.set_send_timestamp(chrono::Utc::now().timestamp_millis());
        envelope
    }

    #[tokio::test]
    async fn routed_envelope_drives_the_saga() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let ack = dispatcher
            .handle(wallet_created_envelope("e-1", Some("c-1")))
            .await;
        assert_eq!(ack, Acknowledgement::Accept);
        assert_eq!(store.get("c-1").unwrap().state, SagaState::WalletCreated);
    }

    #[tokio::test]
    async fn missing_correlation_is_accepted_without_an_instance() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let ack = dispatcher
            .handle(wallet_created_envelope("e-2", None))
            .await;
        assert_eq!(ack, Acknowledgement::Accept);
        assert!(store.get("").is_none());
        assert!(store.get("c-1").is_none());
    }

    #[tokio::test]
    async fn empty_correlation_counts_as_missing() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let mut envelope = wallet_created_envelope("e-3", None);
        envelope.set_correlation_id("");
        let ack = dispatcher.handle(envelope).await;
        assert_eq!(ack, Acknowledgement::Accept);
        assert!(store.get("").is_none());
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected_for_dlq() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let mut envelope = EventEnvelope::new(
            "e-4",
            event_types::FUNDS_ADDED,
            "urn:walletflow:outbox",
            json!({"not": "a domain event"}),
        );
        envelope.set_correlation_id("c-4");

        let ack = dispatcher.handle(envelope).await;
        assert_eq!(ack, Acknowledgement::Reject);
        assert!(store.get("c-4").is_none());
    }

    #[tokio::test]
    async fn unroutable_type_is_rejected() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let mut envelope = EventEnvelope::new(
            "e-5",
            "wallet.saga.completed",
            "urn:walletflow:outbox",
            json!({}),
        );
        envelope.set_correlation_id("c-5");

        let ack = dispatcher.handle(envelope).await;
        assert_eq!(ack, Acknowledgement::Reject);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_accepted_without_second_transition() {
        let store = InMemorySagaStore::arc();
        let dispatcher = handler(store.clone());

        let envelope = wallet_created_envelope("e-6", Some("c-6"));
        assert_eq!(
            dispatcher.handle(envelope.clone()).await,
            Acknowledgement::Accept
        );
        let version = store.get("c-6").unwrap().version;

        assert_eq!(dispatcher.handle(envelope).await, Acknowledgement::Accept);
        assert_eq!(store.get("c-6").unwrap().version, version);
    }
}
