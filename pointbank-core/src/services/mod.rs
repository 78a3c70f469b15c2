//! Service layer - business logic orchestration
//!
//! Services coordinate domain logic and port interactions. The ledger
//! primitives (atomic runner, account locker, transaction log, idempotency
//! gate, batch tracker) are composed by `LedgerService` into the business
//! operations.

mod accounts;
mod atomic;
mod batches;
mod doctor;
mod idempotency;
mod ledger;
pub mod migration;
mod status;
mod transactions;

pub use accounts::{lock_order, AccountLocker, Adjustment, LockedAccounts};
pub use atomic::AtomicRunner;
pub use batches::PointBatchTracker;
pub use doctor::{CheckResult, DoctorResult, DoctorService, DoctorSummary};
pub use idempotency::{GateDecision, IdempotencyGate};
pub use ledger::{
    exchange_key, BonusOutcome, LedgerOutcome, LedgerService, LedgerStores, TransferOutcome,
};
pub use migration::{MigrationResult, MigrationService};
pub use status::{StatusService, StatusSummary};
pub use transactions::TransactionLog;
