//! Closed mapping from event type symbol to bus destination.
//!
//! The registry is constructed once at startup into an immutable value and
//! shared by reference; callers hold a read-only handle. An event type
//! without a binding is a configuration fault surfaced by the dispatcher
//! (skip + counter), never a reason to crash a worker or drop a record.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::event::event_types;

/// Immutable event-type → destination registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRegistry {
    bindings: BTreeMap<String, String>,
}

impl BindingRegistry {
    pub fn builder() -> BindingRegistryBuilder {
        BindingRegistryBuilder {
            bindings: BTreeMap::new(),
        }
    }

    /// The production wallet bindings: the four forward destinations plus
    /// their reversal counterparts used by saga compensation.
    pub fn wallet_defaults() -> Self {
        Self::builder()
            .bind(event_types::WALLET_CREATED, "wallet-created")
            .bind(event_types::FUNDS_ADDED, "funds-added")
            .bind(event_types::FUNDS_WITHDRAWN, "funds-withdrawn")
            .bind(event_types::FUNDS_TRANSFERRED, "funds-transferred")
            .bind(event_types::REVERSAL_CREATED, "wallet-created-reversal")
            .bind(event_types::REVERSAL_FUNDS_ADDED, "funds-added-reversal")
            .bind(
                event_types::REVERSAL_FUNDS_WITHDRAWN,
                "funds-withdrawn-reversal",
            )
            .bind(
                event_types::REVERSAL_FUNDS_TRANSFERRED,
                "funds-transferred-reversal",
            )
            .build()
    }

    /// Destination for an event type, or `None` when the type is unbound.
    pub fn resolve(&self, event_type: &str) -> Option<&str> {
        self.bindings.get(event_type).map(String::as_str)
    }

    pub fn is_bound(&self, event_type: &str) -> bool {
        self.bindings.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Declared event types, in stable order.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Distinct destinations, in stable order.
    pub fn destinations(&self) -> Vec<&str> {
        self.bindings
            .values()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Build-time registry assembly; `bind` overwrites on duplicate keys so the
/// last declaration wins.
#[derive(Debug, Default)]
pub struct BindingRegistryBuilder {
    bindings: BTreeMap<String, String>,
}

impl BindingRegistryBuilder {
    pub fn bind(mut self, event_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.bindings.insert(event_type.into(), destination.into());
        self
    }

    pub fn build(self) -> BindingRegistry {
        BindingRegistry {
            bindings: self.bindings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_declared_types() {
        let registry = BindingRegistry::wallet_defaults();
        assert_eq!(
            registry.resolve(event_types::WALLET_CREATED),
            Some("wallet-created")
        );
        assert_eq!(
            registry.resolve(event_types::FUNDS_TRANSFERRED),
            Some("funds-transferred")
        );
    }

    #[test]
    fn unknown_type_is_unbound() {
        let registry = BindingRegistry::wallet_defaults();
        assert_eq!(registry.resolve("wallet.renamed"), None);
        assert!(!registry.is_bound(""));
    }

    #[test]
    fn later_binding_wins() {
        let registry = BindingRegistry::builder()
            .bind("wallet.created", "a")
            .bind("wallet.created", "b")
            .build();
        assert_eq!(registry.resolve("wallet.created"), Some("b"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn destinations_are_deduplicated() {
        let registry = BindingRegistry::builder()
            .bind("a.one", "shared")
            .bind("a.two", "shared")
            .bind("a.three", "own")
            .build();
        assert_eq!(registry.destinations(), vec!["own", "shared"]);
    }
}
