//! Transaction-scoped event collection.
//!
//! Events emitted inside a domain write transaction must reach the outbox
//! at commit time and must not leak across transactions. The collector is
//! an explicit unit-of-work buffer passed through the transactional scope;
//! the outbox store drains it inside the caller's transaction. No ambient
//! or thread-local state is involved.

use serde_json::Value as JsonValue;

use walletflow_core::CorrelationId;

use crate::event::DomainEvent;

/// One event waiting for the enclosing transaction to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_type: String,
    pub payload: JsonValue,
    pub correlation_id: Option<CorrelationId>,
}

/// Unit-of-work buffer of pending events.
#[derive(Debug, Default)]
pub struct EventCollector {
    pending: Vec<PendingEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an opaque event payload.
    pub fn record(
        &mut self,
        event_type: impl Into<String>,
        payload: JsonValue,
        correlation_id: Option<CorrelationId>,
    ) {
        self.pending.push(PendingEvent {
            event_type: event_type.into(),
            payload,
            correlation_id,
        });
    }

    /// Record a typed wallet event; type symbol and correlation id come
    /// from the event itself.
    pub fn record_event(&mut self, event: &DomainEvent) {
        self.pending.push(PendingEvent {
            event_type: event.event_type().to_string(),
            payload: event.to_payload(),
            correlation_id: event.header.correlation_id.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take all pending events, leaving the collector empty.
    pub fn drain(&mut self) -> Vec<PendingEvent> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{WalletEvent, event_types};
    use walletflow_core::WalletId;

    #[test]
    fn drain_empties_the_collector() {
        let mut collector = EventCollector::new();
        collector.record(
            event_types::WALLET_CREATED,
            serde_json::json!({}),
            CorrelationId::new("c-1").ok(),
        );
        assert_eq!(collector.len(), 1);

        let drained = collector.drain();
        assert_eq!(drained.len(), 1);
        assert!(collector.is_empty());
        assert_eq!(drained[0].event_type, event_types::WALLET_CREATED);
    }

    #[test]
    fn typed_events_carry_their_own_metadata() {
        let correlation = CorrelationId::new("c-2").unwrap();
        let event = DomainEvent::new(
            WalletEvent::FundsAdded {
                wallet_id: WalletId::new(),
                amount: 25,
            },
            Some(correlation.clone()),
        );

        let mut collector = EventCollector::new();
        collector.record_event(&event);

        let drained = collector.drain();
        assert_eq!(drained[0].event_type, event_types::FUNDS_ADDED);
        assert_eq!(drained[0].correlation_id, Some(correlation));
    }
}
