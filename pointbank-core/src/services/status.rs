//! Status service - ledger summary

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::adapters::DuckDbStore;
use crate::domain::Result;

/// Status service for ledger summaries
pub struct StatusService {
    store: Arc<DuckDbStore>,
}

impl StatusService {
    pub fn new(store: Arc<DuckDbStore>) -> Self {
        Self { store }
    }

    /// Get overall status summary
    pub fn get_status(&self) -> Result<StatusSummary> {
        let (total_accounts, active_accounts, total_points) = self.store.account_totals()?;
        let transactions_by_type: BTreeMap<String, i64> =
            self.store.transaction_counts_by_type()?.into_iter().collect();
        let (open_batches, outstanding_batch_points) =
            self.store.outstanding_batch_points(Utc::now())?;
        let keys_by_status: BTreeMap<String, i64> =
            self.store.key_counts_by_status()?.into_iter().collect();

        Ok(StatusSummary {
            total_accounts,
            active_accounts,
            total_points,
            total_transactions: transactions_by_type.values().sum(),
            transactions_by_type,
            open_batches,
            outstanding_batch_points,
            keys_by_status,
            db_path: self.store.db_path().map(|p| p.display().to_string()),
            db_size_bytes: self.store.get_db_size()?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub total_accounts: i64,
    pub active_accounts: i64,
    /// Sum of all balances
    pub total_points: i64,
    pub total_transactions: i64,
    pub transactions_by_type: BTreeMap<String, i64>,
    /// Unexpired batches with points left
    pub open_batches: i64,
    pub outstanding_batch_points: i64,
    pub keys_by_status: BTreeMap<String, i64>,
    pub db_path: Option<String>,
    pub db_size_bytes: u64,
}
