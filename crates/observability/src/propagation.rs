//! Trace context propagation across the bus.
//!
//! On publish, the dispatcher injects the current span's context into the
//! envelope as the `traceparent`/`tracestate` extensions (W3C Trace Context
//! v1) and stamps `sendtimestamp`. On receive, the inbound dispatcher
//! extracts a continuation context and parents its handler span from it,
//! so one workflow can be followed across producer, broker and consumer.
//!
//! Context rides on the envelope, never on thread-local state: the
//! per-message task re-attaches it explicitly after the bus hand-off.

use std::collections::HashMap;

use chrono::Utc;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TraceContextExt;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use walletflow_events::envelope::{EventEnvelope, extension};

/// Result of extracting trace context from an inbound envelope.
#[derive(Debug)]
pub struct ExtractedTraceContext {
    /// Remote parent context, present when the envelope carried a
    /// well-formed `traceparent`. The caller starts a child span from it.
    pub parent: Option<opentelemetry::Context>,
    /// Broker transit lag in milliseconds, when `sendtimestamp` is present.
    pub lag_ms: Option<i64>,
}

impl ExtractedTraceContext {
    /// Re-attach the remote parent to `span` (no-op without a parent).
    pub fn parent_span(&self, span: &tracing::Span) {
        if let Some(parent) = &self.parent {
            span.set_parent(parent.clone());
        }
    }
}

/// Stateless bridge between the active trace context and envelope
/// extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracePropagator;

impl TracePropagator {
    /// Inject the current task's trace context into the envelope.
    ///
    /// Writes `traceparent` and `tracestate` only when an active context
    /// exists (injection is a no-op otherwise); always stamps
    /// `sendtimestamp` with the current instant.
    pub fn inject(envelope: &mut EventEnvelope) {
        let context = tracing::Span::current().context();
        let mut headers = HashMap::<String, String>::new();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&context, &mut HeaderInjector { map: &mut headers });
        });

        if let Some(traceparent) = headers.get("traceparent").filter(|v| !v.trim().is_empty()) {
            envelope.set_traceparent(traceparent.clone());
        }
        if let Some(tracestate) = headers.get("tracestate").filter(|v| !v.trim().is_empty()) {
            envelope.set_tracestate(tracestate.clone());
        }

        envelope.set_send_timestamp(Utc::now().timestamp_millis());
    }

    /// Extract the remote parent context and transit lag from an envelope.
    ///
    /// A malformed `traceparent` yields no parent rather than an error; a
    /// missing `sendtimestamp` yields unknown lag. Observed lag is recorded
    /// into the `messaging.consumer_lag_ms` histogram.
    pub fn extract(envelope: &EventEnvelope) -> ExtractedTraceContext {
        let parent = envelope
            .traceparent()
            .map(|_| {
                opentelemetry::global::get_text_map_propagator(|propagator| {
                    propagator.extract(&EnvelopeExtractor { envelope })
                })
            })
            .filter(|context| context.span().span_context().is_valid());

        let lag_ms = envelope
            .send_timestamp()
            .map(|sent| (Utc::now().timestamp_millis() - sent).max(0));
        if let Some(lag) = lag_ms {
            metrics::histogram!("messaging.consumer_lag_ms", lag as f64);
        }

        ExtractedTraceContext { parent, lag_ms }
    }
}

struct HeaderInjector<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.map.insert(key.to_string(), value);
    }
}

struct EnvelopeExtractor<'a> {
    envelope: &'a EventEnvelope,
}

impl Extractor for EnvelopeExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match key {
            "traceparent" => self.envelope.traceparent(),
            "tracestate" => self.envelope.tracestate(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(2);
        if self.envelope.traceparent().is_some() {
            keys.push(extension::TRACEPARENT);
        }
        if self.envelope.tracestate().is_some() {
            keys.push(extension::TRACESTATE);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        EventEnvelope::new("1", "wallet.created", "urn:walletflow:outbox", json!({}))
    }

    fn install_propagator() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    }

    #[test]
    fn inject_without_active_trace_only_stamps_timestamp() {
        install_propagator();
        let mut env = envelope();
        let before = Utc::now().timestamp_millis();
        TracePropagator::inject(&mut env);

        assert!(env.traceparent().is_none());
        let stamp = env.send_timestamp().unwrap();
        assert!(stamp >= before && stamp <= Utc::now().timestamp_millis());
    }

    #[test]
    fn extract_parses_well_formed_traceparent() {
        install_propagator();
        let mut env = envelope();
        env.set_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        env.set_send_timestamp(Utc::now().timestamp_millis() - 25);

        let extracted = TracePropagator::extract(&env);
        assert!(extracted.parent.is_some());
        assert!(extracted.lag_ms.unwrap() >= 25);
    }

    #[test]
    fn malformed_traceparent_is_ignored() {
        install_propagator();
        let mut env = envelope();
        env.set_traceparent("garbage");

        let extracted = TracePropagator::extract(&env);
        assert!(extracted.parent.is_none());
        assert!(extracted.lag_ms.is_none());
    }

    #[test]
    fn missing_send_timestamp_means_unknown_lag() {
        install_propagator();
        let env = envelope();
        let extracted = TracePropagator::extract(&env);
        assert!(extracted.lag_ms.is_none());
    }
}
