//! Adapter implementations
//!
//! Adapters implement the store ports with concrete technologies:
//! - DuckDB for persistent ledgers
//! - In-process maps for tests and embedding
//!
//! Both share the keyed row-lock table in `locks`.

pub mod duckdb;
pub mod locks;
pub mod memory;

pub use self::duckdb::{DuckDbStore, DuckDbUnit, SettingsPolicy};
pub use self::memory::{MemoryStore, MemoryUnit};
