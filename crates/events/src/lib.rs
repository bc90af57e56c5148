//! Event-plane contracts: the on-the-wire envelope, the domain event sum,
//! the closed binding registry, the message-bus port, the transactional
//! event collector, and the saga state machine.
//!
//! Everything in this crate is pure value/contract code; adapters and
//! durable stores live in `walletflow-infra`.

pub mod binding;
pub mod bus;
pub mod collector;
pub mod envelope;
pub mod event;
pub mod saga;

pub use binding::BindingRegistry;
pub use bus::{Acknowledgement, BusError, EnvelopeHandler, MessageBus};
pub use collector::{EventCollector, PendingEvent};
pub use envelope::{CONTENT_TYPE_JSON, EnvelopeError, EventEnvelope, SPEC_VERSION};
pub use event::{DomainEvent, EventHeader, WalletEvent, event_types};
pub use saga::{SagaEventKind, SagaState, compensation_path, saga_event_for_type, transition};
