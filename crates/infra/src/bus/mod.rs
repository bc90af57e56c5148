//! Message bus adapters.
//!
//! The in-memory adapter is the reference implementation used by tests and
//! single-process deployments; the Redis Streams adapter (feature `redis`)
//! is the durable one.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryBus;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBus;
