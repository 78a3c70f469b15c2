//! Store ports - one trait per persisted entity
//!
//! Every mutating method takes the unit of work it participates in, so the
//! atomic boundary is visible in the signature. Methods without a unit are
//! committed reads or self-contained writes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Account, AccountId, IdempotencyKey, LedgerPolicy, PointBatch, Result, Transaction,
};

/// Account balances and row locks
pub trait AccountStore<U>: Send + Sync {
    /// Register a new account. Fails with `KeyConflict` if the id exists.
    fn insert_account(&self, account: &Account) -> Result<()>;

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Take the exclusive row lock on `id` for the rest of the unit.
    ///
    /// Callers that lock more than one account must go through
    /// `AccountLocker`, which fixes the acquisition order and takes every
    /// lock before the first row is read.
    fn lock_account(&self, unit: &mut U, id: &AccountId) -> Result<()>;

    /// Read an account row locked by `unit`. `None` if it does not exist.
    fn get_locked(&self, unit: &mut U, id: &AccountId) -> Result<Option<Account>>;

    /// Overwrite the balance of an account locked by `unit`
    fn write_balance(
        &self,
        unit: &mut U,
        id: &AccountId,
        balance: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Flip the active flag of an account locked by `unit`
    fn write_active(&self, unit: &mut U, id: &AccountId, active: bool, at: DateTime<Utc>)
        -> Result<()>;
}

/// Append-mostly transaction log
pub trait TransactionStore<U>: Send + Sync {
    fn insert_transaction(&self, unit: &mut U, tx: &Transaction) -> Result<()>;

    /// `pending -> completed`; fails if the row is not pending
    fn mark_completed(&self, unit: &mut U, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Transactions touching `account`, newest first
    fn list_for_account(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>>;
}

/// Expiring point batches
pub trait PointBatchStore<U>: Send + Sync {
    fn insert_batch(&self, unit: &mut U, batch: &PointBatch) -> Result<()>;

    /// Batches of `account` with `remaining > 0` and `expires_at > now`,
    /// oldest created first
    fn consumable_batches(
        &self,
        unit: &mut U,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>>;

    fn set_remaining(&self, unit: &mut U, batch_id: Uuid, remaining: i64) -> Result<()>;

    /// Up to `limit` batches with `expires_at < now` and `remaining > 0`
    fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PointBatch>>;

    /// Force `remaining = 0` on those of `ids` that are still expired with
    /// points left. Returns the affected batches as they were before.
    fn expire_batches(
        &self,
        unit: &mut U,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>>;

    /// Batches of `account` with points left expiring in `[from, until)`
    fn batches_expiring_between(
        &self,
        account: &AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PointBatch>>;
}

/// Idempotency key records
pub trait IdempotencyStore<U>: Send + Sync {
    fn get_key(&self, key: &str) -> Result<Option<IdempotencyKey>>;

    /// Insert a new record. Fails with `KeyConflict` if the key exists.
    fn insert_key(&self, record: &IdempotencyKey) -> Result<()>;

    /// Replace `current` with `replacement` if nobody changed it in between
    /// (compare-and-swap on `version`). Returns whether the swap happened.
    fn reclaim_key(&self, current: &IdempotencyKey, replacement: &IdempotencyKey) -> Result<bool>;

    /// Bind the key to its transaction inside the unit that created it
    fn complete_key(
        &self,
        unit: &mut U,
        key: &str,
        transaction_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark the key failed so a retry may claim it again
    fn fail_key(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Delete expired `failed` records. Completed keys are kept so they keep
    /// replaying; in-flight ones are left to the gate. Returns how many.
    fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Source of the ledger policy, consulted once per operation
pub trait PolicySource: Send + Sync {
    fn resolve(&self) -> Result<LedgerPolicy>;
}

impl PolicySource for LedgerPolicy {
    fn resolve(&self) -> Result<LedgerPolicy> {
        self.validate()?;
        Ok(self.clone())
    }
}
