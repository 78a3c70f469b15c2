//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external dependencies. The ledger
//! services depend only on these traits, not on concrete implementations,
//! so each store can be swapped for a fake independently.

mod repository;
mod unit;

pub use repository::{
    AccountStore, IdempotencyStore, PointBatchStore, PolicySource, TransactionStore,
};
pub use unit::{AtomicExecutor, UnitOfWork};
