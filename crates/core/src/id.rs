//! Strongly-typed identifiers used across the event plane.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a wallet aggregate (opaque to the event plane).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(Uuid);

impl WalletId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for WalletId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for WalletId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for WalletId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("WalletId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Key of a durable outbox record, assigned monotonically at insert.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OutboxRecordId(i64);

impl OutboxRecordId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxRecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for OutboxRecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Workflow-scoped correlation key shared by every event of one saga
/// instance.
///
/// The wire representation is always a string (uuid-sized). The constructor
/// enforces the storage bound; deserialization of persisted values goes
/// through [`CorrelationId::new`] at the trust boundary (inbound dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Maximum stored length, sized for canonical uuid strings.
    pub const MAX_LEN: usize = 36;

    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("CorrelationId: empty"));
        }
        if value.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_id(format!(
                "CorrelationId: {} bytes exceeds {}",
                value.len(),
                Self::MAX_LEN
            )));
        }
        Ok(Self(value))
    }

    /// A fresh random correlation id (UUIDv7 string form).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for CorrelationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_rejects_empty() {
        assert!(CorrelationId::new("").is_err());
    }

    #[test]
    fn correlation_id_rejects_oversized() {
        let long = "x".repeat(CorrelationId::MAX_LEN + 1);
        assert!(CorrelationId::new(long).is_err());
    }

    #[test]
    fn correlation_id_accepts_uuid_strings() {
        let id = CorrelationId::generate();
        assert!(id.as_str().len() <= CorrelationId::MAX_LEN);
        assert_eq!(CorrelationId::new(id.as_str()).unwrap(), id);
    }

    #[test]
    fn outbox_record_id_orders_by_value() {
        assert!(OutboxRecordId::new(1) < OutboxRecordId::new(2));
    }
}
