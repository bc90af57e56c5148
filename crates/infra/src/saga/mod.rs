//! Saga persistence and coordination: durable per-correlation state
//! machine instances, the coordinator that drives them, and the timeout
//! reaper.

pub mod coordinator;
pub mod in_memory;
pub mod postgres;
pub mod reaper;
pub mod store;

pub use coordinator::{SagaCommand, SagaCoordinator, SagaDecision, SagaError};
pub use in_memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use reaper::{ReaperHandle, SagaReaper};
pub use store::{PROCESSED_IDS_CAP, SagaInstance, SagaStore, SagaStoreError};
