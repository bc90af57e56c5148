//! Event-plane configuration.
//!
//! One structured block, deserializable from whatever the host process
//! loads (file, env layer); every field has a production default so an
//! empty block is valid.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration block.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventPlaneConfig {
    pub dispatcher: DispatcherConfig,
    pub saga: SagaConfig,
    pub bus: BusConfig,
}

/// Outbox dispatcher settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between drain ticks.
    pub tick_interval_secs: u64,
    /// Maximum records fetched per tick.
    pub batch_size: u32,
    /// Stable producer URI stamped into every envelope `source`.
    pub source_uri: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            batch_size: 100,
            source_uri: "urn:walletflow:outbox".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn with_tick_interval_secs(mut self, secs: u64) -> Self {
        self.tick_interval_secs = secs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_source_uri(mut self, source_uri: impl Into<String>) -> Self {
        self.source_uri = source_uri.into();
        self
    }
}

/// Saga coordination settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SagaConfig {
    /// Seconds a saga may stay non-terminal before the reaper fails it.
    pub timeout_secs: u64,
    /// Attempts per command before an optimistic-concurrency conflict
    /// escalates the instance.
    pub optimistic_retry_cap: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            optimistic_retry_cap: 3,
        }
    }
}

impl SagaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_optimistic_retry_cap(mut self, cap: u32) -> Self {
        self.optimistic_retry_cap = cap;
        self
    }
}

/// Bus consumption settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Delivery attempts before an envelope is routed to the dead-letter
    /// destination.
    pub dlq_attempt_cap: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { dlq_attempt_cap: 3 }
    }
}

impl BusConfig {
    pub fn with_dlq_attempt_cap(mut self, cap: u32) -> Self {
        self.dlq_attempt_cap = cap;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_yields_defaults() {
        let config: EventPlaneConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.dispatcher.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.batch_size, 100);
        assert_eq!(config.saga.timeout(), Duration::from_secs(1800));
        assert_eq!(config.saga.optimistic_retry_cap, 3);
        assert_eq!(config.bus.dlq_attempt_cap, 3);
    }

    #[test]
    fn partial_block_overrides_selected_fields() {
        let config: EventPlaneConfig = serde_json::from_str(
            r#"{
                "dispatcher": {"tick_interval_secs": 1, "batch_size": 10},
                "saga": {"timeout_secs": 60}
            }"#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.tick_interval_secs, 1);
        assert_eq!(config.dispatcher.batch_size, 10);
        assert_eq!(config.dispatcher.source_uri, "urn:walletflow:outbox");
        assert_eq!(config.saga.timeout_secs, 60);
        assert_eq!(config.bus.dlq_attempt_cap, 3);
    }
}
