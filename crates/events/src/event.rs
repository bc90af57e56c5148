//! Wallet domain events: a tagged sum over the known event kinds plus a
//! small shared header.
//!
//! The event plane itself only reads the header (event id, timestamp,
//! correlation id) and treats the rest as opaque JSON; the typed sum exists
//! so producers and tests have one canonical payload shape per event type.
//!
//! Event type symbols use dotted namespacing (`wallet.created`,
//! `wallet.funds_added`, ...). Reversal events are the compensation
//! counterparts emitted when a saga fails; they carry no amounts of their
//! own — consumers resolve what to undo from the correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use walletflow_core::{CorrelationId, DomainError, WalletId};

/// Stable event type symbols, the keys of the binding registry.
pub mod event_types {
    pub const WALLET_CREATED: &str = "wallet.created";
    pub const FUNDS_ADDED: &str = "wallet.funds_added";
    pub const FUNDS_WITHDRAWN: &str = "wallet.funds_withdrawn";
    pub const FUNDS_TRANSFERRED: &str = "wallet.funds_transferred";

    pub const REVERSAL_CREATED: &str = "wallet.reversal.created";
    pub const REVERSAL_FUNDS_ADDED: &str = "wallet.reversal.funds_added";
    pub const REVERSAL_FUNDS_WITHDRAWN: &str = "wallet.reversal.funds_withdrawn";
    pub const REVERSAL_FUNDS_TRANSFERRED: &str = "wallet.reversal.funds_transferred";
}

/// Shared metadata every domain event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl EventHeader {
    pub fn new(correlation_id: Option<CorrelationId>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            correlation_id,
        }
    }
}

/// The known wallet event kinds. Amounts are minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalletEvent {
    WalletCreated {
        wallet_id: WalletId,
    },
    FundsAdded {
        wallet_id: WalletId,
        amount: i64,
    },
    FundsWithdrawn {
        wallet_id: WalletId,
        amount: i64,
    },
    FundsTransferred {
        from_wallet: WalletId,
        to_wallet: WalletId,
        amount: i64,
    },
    WalletCreationReversed,
    FundsAddedReversed,
    FundsWithdrawnReversed,
    FundsTransferredReversed,
}

impl WalletEvent {
    /// Stable event type symbol for this kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::WalletCreated { .. } => event_types::WALLET_CREATED,
            WalletEvent::FundsAdded { .. } => event_types::FUNDS_ADDED,
            WalletEvent::FundsWithdrawn { .. } => event_types::FUNDS_WITHDRAWN,
            WalletEvent::FundsTransferred { .. } => event_types::FUNDS_TRANSFERRED,
            WalletEvent::WalletCreationReversed => event_types::REVERSAL_CREATED,
            WalletEvent::FundsAddedReversed => event_types::REVERSAL_FUNDS_ADDED,
            WalletEvent::FundsWithdrawnReversed => event_types::REVERSAL_FUNDS_WITHDRAWN,
            WalletEvent::FundsTransferredReversed => event_types::REVERSAL_FUNDS_TRANSFERRED,
        }
    }

    /// Reversal kind for a reversal event type symbol, if there is one.
    pub fn reversal_for(event_type: &str) -> Option<WalletEvent> {
        match event_type {
            event_types::REVERSAL_CREATED => Some(WalletEvent::WalletCreationReversed),
            event_types::REVERSAL_FUNDS_ADDED => Some(WalletEvent::FundsAddedReversed),
            event_types::REVERSAL_FUNDS_WITHDRAWN => Some(WalletEvent::FundsWithdrawnReversed),
            event_types::REVERSAL_FUNDS_TRANSFERRED => {
                Some(WalletEvent::FundsTransferredReversed)
            }
            _ => None,
        }
    }
}

/// Header + payload, the canonical JSON the outbox stores as `payload` and
/// the envelope carries as `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(flatten)]
    pub event: WalletEvent,
}

impl DomainEvent {
    pub fn new(event: WalletEvent, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            header: EventHeader::new(correlation_id),
            event,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("domain event serialization is infallible")
    }

    /// Decode a payload previously produced by [`DomainEvent::to_payload`],
    /// verifying that the embedded kind agrees with the declared envelope
    /// `type`.
    pub fn from_payload(
        declared_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Self, DomainError> {
        let decoded: DomainEvent = serde_json::from_value(payload.clone())
            .map_err(|e| DomainError::validation(format!("domain event decode: {}", e)))?;
        if decoded.event_type() != declared_type {
            return Err(DomainError::validation(format!(
                "payload kind '{}' does not match declared type '{}'",
                decoded.event_type(),
                declared_type
            )));
        }
        Ok(decoded)
    }
}
