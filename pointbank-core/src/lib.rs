//! pointbank core - ledger engine for an internal points economy
//!
//! This crate implements the ledger following hexagonal architecture:
//!
//! - **domain**: ledger entities (Account, Transaction, PointBatch, IdempotencyKey) and errors
//! - **ports**: unit-of-work and per-entity store traits
//! - **services**: atomic runner, ordered locking, idempotency gate, batch tracking, ledger operations
//! - **adapters**: concrete stores (DuckDB, in-memory)

pub mod adapters;
pub mod config;
pub mod domain;
pub mod migrations;
pub mod ports;
pub mod services;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use adapters::{DuckDbStore, SettingsPolicy};
use config::Config;
use services::{DoctorService, LedgerService, StatusService};

// Re-export commonly used types at crate root
pub use domain::{
    Account, AccountId, BatchSource, ConsumptionReport, ExpiringPoints, LedgerError,
    LedgerPolicy, PointBatch, Result, SweepReport, Transaction, TransactionStatus,
    TransactionType,
};
pub use services::{BonusOutcome, LedgerOutcome, TransferOutcome};
pub use tokio_util::sync::CancellationToken;

/// Main context for pointbank operations
///
/// Holds the configuration, the database-backed store and the services
/// built on it.
pub struct PointbankContext {
    pub config: Config,
    pub data_dir: PathBuf,
    pub store: Arc<DuckDbStore>,
    pub ledger: LedgerService<DuckDbStore>,
    pub doctor_service: DoctorService,
    pub status_service: StatusService,
}

impl PointbankContext {
    /// Open the ledger in `data_dir`, creating and migrating the database as needed
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let config = Config::load(data_dir)?;

        let db_path = data_dir.join(&config.db_filename);
        let store = Arc::new(DuckDbStore::open(&db_path)?);
        store.ensure_schema()?;

        let policy = Arc::new(SettingsPolicy::new(config.ledger.clone(), Arc::clone(&store)));
        let ledger = LedgerService::with_store(Arc::clone(&store), policy);
        let doctor_service = DoctorService::new(Arc::clone(&store));
        let status_service = StatusService::new(Arc::clone(&store));

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            ledger,
            doctor_service,
            status_service,
        })
    }
}
