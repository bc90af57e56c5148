//! Transactional outbox: durable record of pending events plus the
//! scheduled dispatcher that drains them to the bus.

pub mod dispatcher;
pub mod in_memory;
pub mod postgres;
pub mod store;

pub use dispatcher::{DispatcherHandle, OutboxDispatcher, TickStats};
pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::{NewOutboxRecord, OutboxRecord, OutboxStore, OutboxStoreError};
