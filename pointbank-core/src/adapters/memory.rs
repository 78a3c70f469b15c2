//! In-process store implementation
//!
//! Implements every store port over hash maps. Writes made through a unit are
//! staged on the unit and applied in one step on commit, so a rolled back or
//! dropped unit leaves no trace. Used as the substitutable fake in tests and
//! for embedding the ledger without a database file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::locks::{account_row, HeldLocks, RowLocks};
use crate::domain::{
    Account, AccountId, IdempotencyKey, KeyStatus, LedgerError, PointBatch, Result, Transaction,
    TransactionStatus,
};
use crate::ports::{
    AccountStore, AtomicExecutor, IdempotencyStore, PointBatchStore, TransactionStore, UnitOfWork,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<Uuid, Transaction>,
    batches: HashMap<Uuid, PointBatch>,
    keys: HashMap<String, IdempotencyKey>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: RowLocks,
    fail_next_commit: AtomicBool,
}

/// In-memory ledger store
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next unit commit fail, as a datastore would on a lost
    /// connection. Test hook.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Sum of all account balances
    pub fn total_balance(&self) -> i64 {
        self.shared.tables.lock().accounts.values().map(|a| a.balance).sum()
    }

    pub fn transaction_count(&self) -> usize {
        self.shared.tables.lock().transactions.len()
    }

    pub fn batches_for(&self, account: &AccountId) -> Vec<PointBatch> {
        let mut batches: Vec<PointBatch> = self
            .shared
            .tables
            .lock()
            .batches
            .values()
            .filter(|b| &b.account_id == account)
            .cloned()
            .collect();
        batches.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        batches
    }
}

#[derive(Default)]
struct Staged {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<Uuid, Transaction>,
    batches: HashMap<Uuid, PointBatch>,
    keys: HashMap<String, IdempotencyKey>,
}

/// Unit of work over a `MemoryStore`
pub struct MemoryUnit {
    id: Uuid,
    shared: Arc<Shared>,
    staged: Staged,
    locks: HeldLocks,
}

impl MemoryUnit {
    fn account(&self, id: &AccountId) -> Option<Account> {
        self.staged
            .accounts
            .get(id)
            .cloned()
            .or_else(|| self.shared.tables.lock().accounts.get(id).cloned())
    }

    fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.staged
            .transactions
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables.lock().transactions.get(&id).cloned())
    }

    fn batch(&self, id: Uuid) -> Option<PointBatch> {
        self.staged
            .batches
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables.lock().batches.get(&id).cloned())
    }
}

impl UnitOfWork for MemoryUnit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn cancel_token(&self) -> &CancellationToken {
        self.locks.cancel_token()
    }

    fn commit(mut self) -> Result<()> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::datastore("injected commit failure"));
        }

        let staged = std::mem::take(&mut self.staged);
        {
            let mut tables = self.shared.tables.lock();
            tables.accounts.extend(staged.accounts);
            tables.transactions.extend(staged.transactions);
            tables.batches.extend(staged.batches);
            tables.keys.extend(staged.keys);
        }
        self.locks.release_all();
        Ok(())
    }

    fn rollback(mut self) -> Result<()> {
        self.staged = Staged::default();
        self.locks.release_all();
        Ok(())
    }
}

impl AtomicExecutor for MemoryStore {
    type Unit = MemoryUnit;

    fn begin(&self, cancel: &CancellationToken, lock_timeout: Duration) -> Result<MemoryUnit> {
        Ok(MemoryUnit {
            id: Uuid::new_v4(),
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
            locks: HeldLocks::new(cancel.clone(), lock_timeout),
        })
    }
}

impl AccountStore<MemoryUnit> for MemoryStore {
    fn insert_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.shared.tables.lock();
        if tables.accounts.contains_key(&account.id) {
            return Err(LedgerError::KeyConflict(format!("account {}", account.id)));
        }
        tables.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.shared.tables.lock().accounts.get(id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> =
            self.shared.tables.lock().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    fn lock_account(&self, unit: &mut MemoryUnit, id: &AccountId) -> Result<()> {
        unit.locks.acquire(&self.shared.locks, &account_row(id))
    }

    fn get_locked(&self, unit: &mut MemoryUnit, id: &AccountId) -> Result<Option<Account>> {
        unit.locks.require(&account_row(id))?;
        Ok(unit.account(id))
    }

    fn write_balance(
        &self,
        unit: &mut MemoryUnit,
        id: &AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        unit.locks.require(&account_row(id))?;
        if balance < 0 {
            return Err(LedgerError::datastore(format!(
                "negative balance rejected for account {}",
                id
            )));
        }
        let mut account = unit
            .account(id)
            .ok_or_else(|| LedgerError::not_found(format!("account {}", id)))?;
        account.balance = balance;
        account.updated_at = at;
        unit.staged.accounts.insert(*id, account);
        Ok(())
    }

    fn write_active(
        &self,
        unit: &mut MemoryUnit,
        id: &AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        unit.locks.require(&account_row(id))?;
        let mut account = unit
            .account(id)
            .ok_or_else(|| LedgerError::not_found(format!("account {}", id)))?;
        account.is_active = active;
        account.updated_at = at;
        unit.staged.accounts.insert(*id, account);
        Ok(())
    }
}

impl TransactionStore<MemoryUnit> for MemoryStore {
    fn insert_transaction(&self, unit: &mut MemoryUnit, tx: &Transaction) -> Result<()> {
        if unit.transaction(tx.id).is_some() {
            return Err(LedgerError::KeyConflict(format!("transaction {}", tx.id)));
        }
        unit.staged.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    fn mark_completed(&self, unit: &mut MemoryUnit, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tx = unit
            .transaction(id)
            .ok_or_else(|| LedgerError::not_found(format!("transaction {}", id)))?;
        if tx.status != TransactionStatus::Pending {
            return Err(LedgerError::datastore(format!("transaction {} is not pending", id)));
        }
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(at);
        unit.staged.transactions.insert(id, tx);
        Ok(())
    }

    fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.shared.tables.lock().transactions.get(&id).cloned())
    }

    fn list_for_account(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        let tables = self.shared.tables.lock();
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.from_account.as_ref() == Some(account) || t.to_account.as_ref() == Some(account))
            .cloned()
            .collect();
        txs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        txs.truncate(limit);
        Ok(txs)
    }
}

impl PointBatchStore<MemoryUnit> for MemoryStore {
    fn insert_batch(&self, unit: &mut MemoryUnit, batch: &PointBatch) -> Result<()> {
        unit.staged.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    fn consumable_batches(
        &self,
        unit: &mut MemoryUnit,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        let mut merged: HashMap<Uuid, PointBatch> = self
            .shared
            .tables
            .lock()
            .batches
            .values()
            .filter(|b| &b.account_id == account)
            .map(|b| (b.id, b.clone()))
            .collect();
        for batch in unit.staged.batches.values().filter(|b| &b.account_id == account) {
            merged.insert(batch.id, batch.clone());
        }

        let mut batches: Vec<PointBatch> = merged
            .into_values()
            .filter(|b| b.is_consumable(now))
            .collect();
        batches.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(batches)
    }

    fn set_remaining(&self, unit: &mut MemoryUnit, batch_id: Uuid, remaining: i64) -> Result<()> {
        let mut batch = unit
            .batch(batch_id)
            .ok_or_else(|| LedgerError::not_found(format!("batch {}", batch_id)))?;
        if remaining < 0 || remaining > batch.remaining_amount {
            return Err(LedgerError::datastore(format!(
                "batch {} remaining may only decrease ({} -> {})",
                batch_id, batch.remaining_amount, remaining
            )));
        }
        batch.remaining_amount = remaining;
        unit.staged.batches.insert(batch_id, batch);
        Ok(())
    }

    fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PointBatch>> {
        let tables = self.shared.tables.lock();
        let mut batches: Vec<PointBatch> = tables
            .batches
            .values()
            .filter(|b| b.is_expired(now) && b.remaining_amount > 0)
            .cloned()
            .collect();
        batches.sort_by(|a, b| (a.expires_at, a.id).cmp(&(b.expires_at, b.id)));
        batches.truncate(limit);
        Ok(batches)
    }

    fn expire_batches(
        &self,
        unit: &mut MemoryUnit,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        let mut affected = Vec::new();
        for id in ids {
            let Some(mut batch) = unit.batch(*id) else {
                continue;
            };
            if batch.is_expired(now) && batch.remaining_amount > 0 {
                affected.push(batch.clone());
                batch.remaining_amount = 0;
                unit.staged.batches.insert(*id, batch);
            }
        }
        Ok(affected)
    }

    fn batches_expiring_between(
        &self,
        account: &AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>> {
        let tables = self.shared.tables.lock();
        let mut batches: Vec<PointBatch> = tables
            .batches
            .values()
            .filter(|b| {
                &b.account_id == account
                    && b.remaining_amount > 0
                    && b.expires_at >= from
                    && b.expires_at < until
            })
            .cloned()
            .collect();
        batches.sort_by(|a, b| (a.expires_at, a.id).cmp(&(b.expires_at, b.id)));
        Ok(batches)
    }
}

impl IdempotencyStore<MemoryUnit> for MemoryStore {
    fn get_key(&self, key: &str) -> Result<Option<IdempotencyKey>> {
        Ok(self.shared.tables.lock().keys.get(key).cloned())
    }

    fn insert_key(&self, record: &IdempotencyKey) -> Result<()> {
        let mut tables = self.shared.tables.lock();
        if tables.keys.contains_key(&record.key) {
            return Err(LedgerError::KeyConflict(format!("idempotency key {}", record.key)));
        }
        tables.keys.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn reclaim_key(&self, current: &IdempotencyKey, replacement: &IdempotencyKey) -> Result<bool> {
        let mut tables = self.shared.tables.lock();
        match tables.keys.get_mut(&current.key) {
            Some(stored) if stored.version == current.version => {
                *stored = replacement.clone();
                stored.version = current.version + 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete_key(
        &self,
        unit: &mut MemoryUnit,
        key: &str,
        transaction_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = match unit.staged.keys.get(key) {
            Some(record) => record.clone(),
            None => self
                .get_key(key)?
                .ok_or_else(|| LedgerError::not_found(format!("idempotency key {}", key)))?,
        };
        record.status = KeyStatus::Completed;
        record.transaction_id = Some(transaction_id);
        record.updated_at = at;
        record.version += 1;
        unit.staged.keys.insert(key.to_string(), record);
        Ok(())
    }

    fn fail_key(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.shared.tables.lock();
        if let Some(record) = tables.keys.get_mut(key) {
            if record.status != KeyStatus::Completed {
                record.status = KeyStatus::Failed;
                record.updated_at = at;
                record.version += 1;
            }
        }
        Ok(())
    }

    fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.shared.tables.lock();
        let before = tables.keys.len();
        tables
            .keys
            .retain(|_, k| !(k.is_expired(now) && k.status == KeyStatus::Failed));
        Ok(before - tables.keys.len())
    }
}
