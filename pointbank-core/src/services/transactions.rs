//! Transaction log service

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{AccountId, LedgerError, Result, Transaction};
use crate::ports::TransactionStore;

/// Append-mostly log of balance-affecting events
///
/// Rows are written `pending` and completed once, inside the unit that
/// created them. A unit that fails before committing leaves no row behind.
pub struct TransactionLog<U> {
    store: Arc<dyn TransactionStore<U>>,
}

impl<U> TransactionLog<U> {
    pub fn new(store: Arc<dyn TransactionStore<U>>) -> Self {
        Self { store }
    }

    pub fn append_pending(&self, unit: &mut U, tx: &Transaction) -> Result<()> {
        if tx.amount <= 0 {
            return Err(LedgerError::validation("transaction amount must be positive"));
        }
        if tx.is_completed() {
            return Err(LedgerError::validation(format!(
                "transaction {} must be appended as pending",
                tx.id
            )));
        }
        self.store.insert_transaction(unit, tx)
    }

    pub fn complete(&self, unit: &mut U, tx: &mut Transaction, at: DateTime<Utc>) -> Result<()> {
        self.store.mark_completed(unit, tx.id, at)?;
        tx.complete(at)
    }

    /// Append `tx` and complete it in the same unit
    pub fn record(&self, unit: &mut U, mut tx: Transaction, at: DateTime<Utc>) -> Result<Transaction> {
        self.append_pending(unit, &tx)?;
        self.complete(unit, &mut tx, at)?;
        Ok(tx)
    }

    pub fn get(&self, id: Uuid) -> Result<Transaction> {
        self.store
            .get_transaction(id)?
            .ok_or_else(|| LedgerError::not_found(format!("transaction {}", id)))
    }

    /// Newest first
    pub fn history(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        self.store.list_for_account(account, limit)
    }
}
