//! Core vocabulary of the wallet event plane: identifiers and the domain
//! error model. No IO, no async, no infrastructure assumptions.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, OutboxRecordId, WalletId};
