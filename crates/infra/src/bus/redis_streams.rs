//! Redis Streams-backed bus adapter (durable, at-least-once delivery).
//!
//! - One stream per destination (`walletflow:<destination>`), so publish
//!   order per destination is the stream order.
//! - `publish` returns only after XADD is confirmed (the durability point).
//! - `subscribe` creates a consumer group (XGROUP CREATE MKSTREAM) and
//!   runs a polling thread: new entries via XREADGROUP, stale pending
//!   entries reclaimed via XPENDING + XCLAIM, acknowledgement via XACK.
//! - An envelope rejected past the attempt cap, or one that fails to
//!   parse, is appended to `walletflow:<destination>.dlq` and acknowledged
//!   on the source stream.
//!
//! Handlers are async while the redis client here is synchronous; the
//! consumer thread re-enters the runtime captured at subscribe time for
//! each delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use walletflow_events::bus::{
    Acknowledgement, BusError, EnvelopeHandler, MessageBus, dlq_destination,
};
use walletflow_events::envelope::EventEnvelope;

const STREAM_PREFIX: &str = "walletflow:";

/// Blocking timeout for XREADGROUP (also the shutdown poll granularity).
const BLOCK_MS: u64 = 1000;

/// Entries fetched per poll.
const READ_COUNT: usize = 10;

/// Pending entries idle longer than this are reclaimed (covers consumers
/// that died mid-delivery).
const PENDING_IDLE_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RedisStreamsBus {
    client: Arc<redis::Client>,
    dlq_attempt_cap: u32,
    consumer_name: String,
    shutdown: Arc<AtomicBool>,
}

impl RedisStreamsBus {
    pub fn new(redis_url: impl AsRef<str>, dlq_attempt_cap: u32) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            dlq_attempt_cap: dlq_attempt_cap.max(1),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Ask every consumer thread spawned from this bus to stop after its
    /// current poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn stream_key(destination: &str) -> String {
        format!("{STREAM_PREFIX}{destination}")
    }

    fn connection(&self) -> Result<redis::Connection, BusError> {
        self.client
            .get_connection()
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    /// Idempotent consumer-group creation; an already-existing group is
    /// not an error.
    fn ensure_consumer_group(&self, stream_key: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.connection()?;
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        Ok(())
    }

    fn publish_sync(&self, destination: &str, envelope: &EventEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(Self::stream_key(destination))
            .arg("*")
            .arg("envelope_id")
            .arg(envelope.id())
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| BusError::publish(destination, format!("XADD failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, destination: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        let bus = self.clone();
        let destination = destination.to_string();
        tokio::task::spawn_blocking(move || bus.publish_sync(&destination, &envelope))
            .await
            .map_err(|e| BusError::Connection(format!("publish task join: {e}")))?
    }

    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<(), BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BusError::subscribe(destination, "subscribe requires a tokio runtime")
        })?;

        let stream_key = Self::stream_key(destination);
        self.ensure_consumer_group(&stream_key, group)?;

        let consumer = ConsumerLoop {
            bus: self.clone(),
            stream_key,
            dlq_stream: Self::stream_key(&dlq_destination(destination)),
            group: group.to_string(),
            handler,
            runtime,
        };

        let name = format!("redis-consumer-{destination}-{group}");
        std::thread::Builder::new()
            .name(name)
            .spawn(move || consumer.run())
            .map_err(|e| BusError::subscribe(destination, e))?;

        Ok(())
    }
}

struct ConsumerLoop {
    bus: RedisStreamsBus,
    stream_key: String,
    dlq_stream: String,
    group: String,
    handler: Arc<dyn EnvelopeHandler>,
    runtime: tokio::runtime::Handle,
}

impl ConsumerLoop {
    fn run(self) {
        info!(stream = %self.stream_key, group = %self.group, "redis consumer started");

        loop {
            if self.bus.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let messages = match self.poll() {
                Ok(messages) => messages,
                Err(err) => {
                    error!(stream = %self.stream_key, error = %err, "redis poll failed");
                    std::thread::sleep(Duration::from_millis(BLOCK_MS));
                    continue;
                }
            };

            for (message_id, payload) in messages {
                self.process(&message_id, &payload);
            }
        }

        info!(stream = %self.stream_key, group = %self.group, "redis consumer stopped");
    }

    /// Stale pending entries first (redelivery), then new ones.
    fn poll(&self) -> Result<Vec<(String, String)>, BusError> {
        let mut conn = self.bus.connection()?;

        let pending = self.read_pending(&mut conn)?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read_new(&mut conn)
    }

    fn read_pending(
        &self,
        conn: &mut redis::Connection,
    ) -> Result<Vec<(String, String)>, BusError> {
        // (id, consumer, idle_ms, delivery_count) per pending entry.
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(READ_COUNT)
            .query(conn)
            .unwrap_or_default();

        let stale_ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, _, idle_ms, _)| *idle_ms >= PENDING_IDLE_MS)
            .map(|(id, _, _, _)| id)
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: Vec<(String, Vec<(String, String)>)> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.bus.consumer_name)
            .arg(PENDING_IDLE_MS)
            .arg(&stale_ids[..])
            .query(conn)
            .map_err(|e| {
                BusError::subscribe(self.stream_key.as_str(), format!("XCLAIM failed: {e}"))
            })?;

        Ok(extract_payloads(claimed))
    }

    fn read_new(&self, conn: &mut redis::Connection) -> Result<Vec<(String, String)>, BusError> {
        // Nil reply on block timeout.
        type Reply = Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>;

        let reply: Reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.bus.consumer_name)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| {
                BusError::subscribe(self.stream_key.as_str(), format!("XREADGROUP failed: {e}"))
            })?;

        let Some(streams) = reply else {
            return Ok(Vec::new());
        };

        Ok(streams
            .into_iter()
            .filter(|(key, _)| key == &self.stream_key)
            .flat_map(|(_, entries)| extract_payloads(entries))
            .collect())
    }

    fn process(&self, message_id: &str, payload: &str) {
        match serde_json::from_str::<EventEnvelope>(payload) {
            Ok(envelope) => {
                let mut attempts = 0u32;
                loop {
                    attempts += 1;
                    let ack = self
                        .runtime
                        .block_on(self.handler.handle(envelope.clone()));
                    match ack {
                        Acknowledgement::Accept => break,
                        Acknowledgement::Reject if attempts >= self.bus.dlq_attempt_cap => {
                            warn!(
                                stream = %self.stream_key,
                                envelope_id = %envelope.id(),
                                attempts,
                                "envelope rejected past attempt cap; dead-lettering"
                            );
                            self.dead_letter(message_id, payload, attempts);
                            break;
                        }
                        Acknowledgement::Reject => continue,
                    }
                }
            }
            Err(err) => {
                warn!(
                    stream = %self.stream_key,
                    message_id = %message_id,
                    error = %err,
                    "undecodable envelope; dead-lettering"
                );
                self.dead_letter(message_id, payload, 0);
            }
        }

        self.acknowledge(message_id);
    }

    fn dead_letter(&self, original_message_id: &str, payload: &str, attempts: u32) {
        let result: Result<String, _> = self.bus.connection().and_then(|mut conn| {
            redis::cmd("XADD")
                .arg(&self.dlq_stream)
                .arg("*")
                .arg("original_message_id")
                .arg(original_message_id)
                .arg("attempts")
                .arg(attempts.to_string())
                .arg("failed_at")
                .arg(chrono::Utc::now().to_rfc3339())
                .arg("payload")
                .arg(payload)
                .query(&mut conn)
                .map_err(|e| BusError::publish(self.dlq_stream.as_str(), format!("DLQ XADD failed: {e}")))
        });

        if let Err(err) = result {
            error!(stream = %self.dlq_stream, error = %err, "dead-letter append failed");
        }
    }

    fn acknowledge(&self, message_id: &str) {
        let result: Result<u64, _> = self.bus.connection().and_then(|mut conn| {
            redis::cmd("XACK")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(message_id)
                .query(&mut conn)
                .map_err(|e| {
                    BusError::subscribe(self.stream_key.as_str(), format!("XACK failed: {e}"))
                })
        });

        if let Err(err) = result {
            // Unacked entries are redelivered via the pending scan; the
            // consumer must stay idempotent either way.
            warn!(stream = %self.stream_key, message_id = %message_id, error = %err, "XACK failed");
        }
    }
}

/// Pull the `payload` field out of stream entries.
fn extract_payloads(entries: Vec<(String, Vec<(String, String)>)>) -> Vec<(String, String)> {
    entries
        .into_iter()
        .filter_map(|(id, fields)| {
            fields
                .into_iter()
                .find(|(name, _)| name == "payload")
                .map(|(_, value)| (id, value))
        })
        .collect()
}
