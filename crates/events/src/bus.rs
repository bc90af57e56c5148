//! Message bus port: the duplex capability the event plane talks to.
//!
//! Delivery is at-least-once; consumers must be idempotent. Within one
//! (destination, group) envelopes are delivered in publish order; multiple
//! subscribers in the same group share the work, distinct groups each see
//! every envelope. A handler signals redelivery by rejecting; adapters
//! route an envelope to `<destination>.dlq` once the configured attempt
//! cap is exhausted.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::EventEnvelope;

/// Outcome a handler reports for one delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The envelope was handled (or deterministically rejected as a
    /// duplicate/no-op); the bus must not redeliver it.
    Accept,
    /// The envelope was not handled; the bus redelivers, dead-lettering
    /// after its attempt cap.
    Reject,
}

impl Acknowledgement {
    pub fn is_accept(&self) -> bool {
        matches!(self, Acknowledgement::Accept)
    }
}

/// Bus-level failure.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish to '{destination}' failed: {reason}")]
    Publish { destination: String, reason: String },

    #[error("subscribe to '{destination}' failed: {reason}")]
    Subscribe { destination: String, reason: String },

    #[error("bus connection failed: {0}")]
    Connection(String),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

impl BusError {
    pub fn publish(destination: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    pub fn subscribe(destination: impl Into<String>, reason: impl ToString) -> Self {
        Self::Subscribe {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }
}

/// Consumer callback invoked once per delivered envelope.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> Acknowledgement;
}

/// Abstract duplex bus capability.
///
/// `publish` is synchronous from the caller's perspective: `Ok(())` means
/// the adapter's durability point acknowledged the envelope. Adapters may
/// batch internally, but must not report success before that point.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, destination: &str, envelope: EventEnvelope) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, destination: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        (**self).publish(destination, envelope).await
    }

    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), BusError> {
        (**self).subscribe(destination, group, handler).await
    }
}

/// Dead-letter destination for a source destination.
pub fn dlq_destination(destination: &str) -> String {
    format!("{destination}.dlq")
}
