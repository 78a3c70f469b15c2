//! Core domain entities
//!
//! All ledger entities are defined here. These are pure data structures
//! with validation logic - no I/O or external dependencies.

mod account;
mod batch;
mod idempotency;
mod policy;
pub mod result;
mod transaction;

pub use account::{Account, AccountId};
pub use batch::{BatchSource, ConsumptionReport, ExpiringPoints, PointBatch, SweepReport};
pub use idempotency::{request_fingerprint, IdempotencyKey, KeyStatus};
pub use policy::{BatchTtlDays, LedgerPolicy, MAX_DAYS};
pub use result::{LedgerError, Result};
pub use transaction::{Transaction, TransactionStatus, TransactionType};
