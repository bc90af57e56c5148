//! Standardized event envelope (CloudEvents 1.0, structured JSON content).
//!
//! The envelope is the **unit of transport**: the outbox dispatcher produces
//! it, the bus carries it, the inbound dispatcher consumes it. It separates
//! transport metadata (identity, type, source, trace context, correlation)
//! from the opaque domain payload, so consumers never depend on producer
//! types.
//!
//! Recognized extension attributes are `correlationid`, `traceparent`,
//! `tracestate` and `sendtimestamp`; any other extension is preserved
//! verbatim across a serialize/deserialize round trip so intermediaries
//! stay producer-agnostic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// CloudEvents specification version emitted and accepted by this crate.
pub const SPEC_VERSION: &str = "1.0";

/// The only payload content type the event plane produces.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Names of the extension attributes the core reads and writes.
pub mod extension {
    pub const CORRELATION_ID: &str = "correlationid";
    pub const TRACEPARENT: &str = "traceparent";
    pub const TRACESTATE: &str = "tracestate";
    pub const SEND_TIMESTAMP: &str = "sendtimestamp";
}

/// Envelope validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("unsupported specversion '{0}'")]
    UnsupportedSpecVersion(String),

    #[error("unsupported datacontenttype '{0}'")]
    UnsupportedContentType(String),
}

/// Standardized event envelope.
///
/// Construction via [`EventEnvelope::new`] fills the fixed attributes
/// (`specversion`, `datacontenttype`, `time`); extensions are attached with
/// the typed setters. [`EventEnvelope::validate`] checks the publish-time
/// required set: non-empty `id`, `type`, `source`, a non-null `data` and a
/// `sendtimestamp` extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    specversion: String,
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    datacontenttype: String,
    time: DateTime<Utc>,
    data: JsonValue,

    /// Extension attributes, recognized or not, in wire form.
    #[serde(flatten)]
    extensions: BTreeMap<String, JsonValue>,
}

impl EventEnvelope {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            datacontenttype: CONTENT_TYPE_JSON.to_string(),
            time: Utc::now(),
            data,
            extensions: BTreeMap::new(),
        }
    }

    pub fn spec_version(&self) -> &str {
        &self.specversion
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn content_type(&self) -> &str {
        &self.datacontenttype
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }

    /// Raw extension attribute by name.
    pub fn extension(&self, name: &str) -> Option<&JsonValue> {
        self.extensions.get(name)
    }

    /// Set an arbitrary extension attribute (wire value).
    pub fn set_extension(&mut self, name: impl Into<String>, value: JsonValue) {
        self.extensions.insert(name.into(), value);
    }

    /// All extension attributes in stable (sorted) order.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.extensions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.string_extension(extension::CORRELATION_ID)
    }

    pub fn set_correlation_id(&mut self, value: impl Into<String>) {
        self.set_extension(extension::CORRELATION_ID, JsonValue::String(value.into()));
    }

    pub fn traceparent(&self) -> Option<&str> {
        self.string_extension(extension::TRACEPARENT)
    }

    pub fn set_traceparent(&mut self, value: impl Into<String>) {
        self.set_extension(extension::TRACEPARENT, JsonValue::String(value.into()));
    }

    pub fn tracestate(&self) -> Option<&str> {
        self.string_extension(extension::TRACESTATE)
    }

    pub fn set_tracestate(&mut self, value: impl Into<String>) {
        self.set_extension(extension::TRACESTATE, JsonValue::String(value.into()));
    }

    /// Producer send instant in epoch milliseconds, if stamped.
    pub fn send_timestamp(&self) -> Option<i64> {
        self.extension(extension::SEND_TIMESTAMP)?.as_i64()
    }

    pub fn set_send_timestamp(&mut self, epoch_millis: i64) {
        self.set_extension(
            extension::SEND_TIMESTAMP,
            JsonValue::Number(epoch_millis.into()),
        );
    }

    /// Check the publish-time required attribute set.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.specversion != SPEC_VERSION {
            return Err(EnvelopeError::UnsupportedSpecVersion(
                self.specversion.clone(),
            ));
        }
        if self.datacontenttype != CONTENT_TYPE_JSON {
            return Err(EnvelopeError::UnsupportedContentType(
                self.datacontenttype.clone(),
            ));
        }
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingAttribute("id"));
        }
        if self.event_type.is_empty() {
            return Err(EnvelopeError::MissingAttribute("type"));
        }
        if self.source.is_empty() {
            return Err(EnvelopeError::MissingAttribute("source"));
        }
        if self.data.is_null() {
            return Err(EnvelopeError::MissingAttribute("data"));
        }
        if self.send_timestamp().is_none() {
            return Err(EnvelopeError::MissingAttribute(extension::SEND_TIMESTAMP));
        }
        Ok(())
    }

    fn string_extension(&self, name: &str) -> Option<&str> {
        self.extension(name)?.as_str()
    }
}
