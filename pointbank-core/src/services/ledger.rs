//! Ledger operations
//!
//! Every balance-affecting operation follows the same skeleton: validate,
//! consult the idempotency gate, open an atomic unit, lock and adjust the
//! accounts in global order, record the transaction, update the point batch
//! overlay, bind the idempotency key, commit.
//!
//! Batch overlay failures are logged and do not block the balance change,
//! unless the datastore aborted the unit over them; then the whole operation
//! fails with `CommitFailure`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::accounts::{AccountLocker, Adjustment};
use super::atomic::AtomicRunner;
use super::batches::PointBatchTracker;
use super::idempotency::{GateDecision, IdempotencyGate};
use super::transactions::TransactionLog;
use crate::domain::{
    request_fingerprint, Account, AccountId, BatchSource, ConsumptionReport, ExpiringPoints,
    LedgerError, LedgerPolicy, Result, SweepReport, Transaction, TransactionType,
};
use crate::ports::{
    AccountStore, AtomicExecutor, IdempotencyStore, PointBatchStore, PolicySource,
    TransactionStore, UnitOfWork,
};

/// The four stores a ledger works against, each independently replaceable
pub struct LedgerStores<U> {
    pub accounts: Arc<dyn AccountStore<U>>,
    pub transactions: Arc<dyn TransactionStore<U>>,
    pub batches: Arc<dyn PointBatchStore<U>>,
    pub keys: Arc<dyn IdempotencyStore<U>>,
}

impl<U> LedgerStores<U> {
    /// Use one store for every port
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: AccountStore<U> + TransactionStore<U> + PointBatchStore<U> + IdempotencyStore<U> + 'static,
    {
        Self {
            accounts: store.clone(),
            transactions: store.clone(),
            batches: store.clone(),
            keys: store,
        }
    }
}

impl<U> Clone for LedgerStores<U> {
    fn clone(&self) -> Self {
        Self {
            accounts: Arc::clone(&self.accounts),
            transactions: Arc::clone(&self.transactions),
            batches: Arc::clone(&self.batches),
            keys: Arc::clone(&self.keys),
        }
    }
}

/// Result of a transfer: the completed transaction and both accounts as
/// they stand afterwards
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub transaction: Transaction,
    pub from: Account,
    pub to: Account,
    /// The key had already completed; nothing was executed
    pub replayed: bool,
}

/// Result of a single-account operation
#[derive(Debug, Clone, Serialize)]
pub struct LedgerOutcome {
    pub transaction: Transaction,
    pub account: Account,
    pub replayed: bool,
    /// Batch consumption, when the operation spent points and it succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumption: Option<ConsumptionReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BonusOutcome {
    Granted { transaction: Transaction, account: Account },
    /// Nothing was awarded; the ledger was not touched
    NoOp,
}

enum Keyed<T> {
    Executed(Transaction, T),
    Replayed(Transaction),
}

/// Ledger service
pub struct LedgerService<X: AtomicExecutor> {
    runner: AtomicRunner<X>,
    locker: AccountLocker<X::Unit>,
    log: TransactionLog<X::Unit>,
    gate: IdempotencyGate<X::Unit>,
    tracker: PointBatchTracker<X::Unit>,
    accounts: Arc<dyn AccountStore<X::Unit>>,
    policy: Arc<dyn PolicySource>,
}

impl<X: AtomicExecutor> LedgerService<X> {
    pub fn new(executor: Arc<X>, stores: LedgerStores<X::Unit>, policy: Arc<dyn PolicySource>) -> Self {
        Self {
            runner: AtomicRunner::new(executor),
            locker: AccountLocker::new(Arc::clone(&stores.accounts)),
            log: TransactionLog::new(Arc::clone(&stores.transactions)),
            gate: IdempotencyGate::new(Arc::clone(&stores.keys), Arc::clone(&stores.transactions)),
            tracker: PointBatchTracker::new(Arc::clone(&stores.batches)),
            accounts: stores.accounts,
            policy,
        }
    }

    /// Ledger over a single store implementing every port
    pub fn with_store(store: Arc<X>, policy: Arc<dyn PolicySource>) -> Self
    where
        X: AccountStore<X::Unit>
            + TransactionStore<X::Unit>
            + PointBatchStore<X::Unit>
            + IdempotencyStore<X::Unit>
            + 'static,
    {
        let stores = LedgerStores::from_store(Arc::clone(&store));
        Self::new(store, stores, policy)
    }

    // === Balance-affecting operations ===

    /// Move `amount` points from one account to another
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: i64,
        idempotency_key: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        require_positive(amount)?;
        if from == to {
            return Err(LedgerError::validation("cannot transfer to the same account"));
        }
        let policy = self.policy.resolve()?;
        let batch_ttl = policy.batch_ttl(BatchSource::Transfer)?;
        let fingerprint = request_fingerprint(&[
            TransactionType::Transfer.as_str(),
            &from.to_string(),
            &to.to_string(),
            &amount.to_string(),
            description,
        ]);

        let outcome = self.run_keyed(idempotency_key, from, &fingerprint, &policy, cancel, |unit| {
            let now = Utc::now();
            let mut accounts = self.locker.lock_and_adjust_all(
                unit,
                &[Adjustment::debit(from, amount), Adjustment::credit(to, amount)],
                now,
            )?;

            let tx = Transaction::pending(TransactionType::Transfer, Some(from), Some(to), amount)
                .with_idempotency_key(Some(idempotency_key))
                .with_metadata(json!({ "description": description }));
            let tx = self.log.record(unit, tx, now)?;

            self.consume_overlay(unit, &from, amount, now)?;
            self.issue_overlay(unit, to, amount, BatchSource::Transfer, tx.id, batch_ttl, now)?;

            let from_account = take_account(&mut accounts, &from)?;
            let to_account = take_account(&mut accounts, &to)?;
            Ok((tx, (from_account, to_account)))
        })?;

        Ok(match outcome {
            Keyed::Executed(transaction, (from, to)) => {
                info!(transaction = %transaction.id, amount, "transfer committed");
                TransferOutcome {
                    transaction,
                    from,
                    to,
                    replayed: false,
                }
            }
            Keyed::Replayed(transaction) => TransferOutcome {
                transaction,
                from: self.get_account(&from)?,
                to: self.get_account(&to)?,
                replayed: true,
            },
        })
    }

    /// Administrative credit. The caller has already checked `admin`'s authority.
    pub fn grant_points(
        &self,
        admin: AccountId,
        target: AccountId,
        amount: i64,
        idempotency_key: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<LedgerOutcome> {
        require_positive(amount)?;
        let policy = self.policy.resolve()?;
        let batch_ttl = policy.batch_ttl(BatchSource::AdminGrant)?;
        let fingerprint = request_fingerprint(&[
            TransactionType::AdminGrant.as_str(),
            &admin.to_string(),
            &target.to_string(),
            &amount.to_string(),
            description,
        ]);

        let outcome = self.run_keyed(idempotency_key, target, &fingerprint, &policy, cancel, |unit| {
            let now = Utc::now();
            let account = self.locker.lock_and_adjust(unit, target, amount, false, now)?;

            let tx = Transaction::pending(TransactionType::AdminGrant, None, Some(target), amount)
                .with_idempotency_key(Some(idempotency_key))
                .with_metadata(json!({
                    "admin_account": admin.to_string(),
                    "description": description,
                }));
            let tx = self.log.record(unit, tx, now)?;

            self.issue_overlay(unit, target, amount, BatchSource::AdminGrant, tx.id, batch_ttl, now)?;
            Ok((tx, (account, None)))
        })?;

        self.single_account_outcome(outcome, &target, "admin grant committed")
    }

    /// Administrative debit. Fails with `InsufficientBalance` if the target
    /// holds less than `amount`.
    pub fn deduct_points(
        &self,
        admin: AccountId,
        target: AccountId,
        amount: i64,
        idempotency_key: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<LedgerOutcome> {
        require_positive(amount)?;
        let policy = self.policy.resolve()?;
        let fingerprint = request_fingerprint(&[
            TransactionType::AdminDeduct.as_str(),
            &admin.to_string(),
            &target.to_string(),
            &amount.to_string(),
            description,
        ]);

        let outcome = self.run_keyed(idempotency_key, target, &fingerprint, &policy, cancel, |unit| {
            let now = Utc::now();
            let account = self.locker.lock_and_adjust(unit, target, amount, true, now)?;

            let tx = Transaction::pending(TransactionType::AdminDeduct, Some(target), None, amount)
                .with_idempotency_key(Some(idempotency_key))
                .with_metadata(json!({
                    "admin_account": admin.to_string(),
                    "description": description,
                }));
            let tx = self.log.record(unit, tx, now)?;

            let consumption = self.consume_overlay(unit, &target, amount, now)?;
            Ok((tx, (account, consumption)))
        })?;

        self.single_account_outcome(outcome, &target, "admin deduct committed")
    }

    /// Charge `cost` points for a product redemption identified by `reference_id`
    ///
    /// The idempotency key is derived from the account and reference, so a
    /// retried redemption is charged once.
    pub fn consume_for_exchange(
        &self,
        account: AccountId,
        cost: i64,
        reference_id: &str,
        cancel: &CancellationToken,
    ) -> Result<LedgerOutcome> {
        require_positive(cost)?;
        if reference_id.trim().is_empty() {
            return Err(LedgerError::validation("exchange reference id must not be empty"));
        }
        let policy = self.policy.resolve()?;
        let key = exchange_key(&account, reference_id);
        let fingerprint = request_fingerprint(&[
            TransactionType::ExchangeConsumption.as_str(),
            &account.to_string(),
            &cost.to_string(),
            reference_id,
        ]);

        let outcome = self.run_keyed(&key, account, &fingerprint, &policy, cancel, |unit| {
            let now = Utc::now();
            let refreshed = self.locker.lock_and_adjust(unit, account, cost, true, now)?;

            let tx = Transaction::pending(TransactionType::ExchangeConsumption, Some(account), None, cost)
                .with_idempotency_key(Some(key.as_str()))
                .with_metadata(json!({ "reference_id": reference_id }));
            let tx = self.log.record(unit, tx, now)?;

            let consumption = self.consume_overlay(unit, &account, cost, now)?;
            Ok((tx, (refreshed, consumption)))
        })?;

        self.single_account_outcome(outcome, &account, "exchange consumption committed")
    }

    /// Award a daily bonus. Zero awards, and any award while bonuses are
    /// disabled, leave the ledger untouched.
    pub fn grant_bonus(
        &self,
        account: AccountId,
        amount: i64,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<BonusOutcome> {
        if amount == 0 {
            return Ok(BonusOutcome::NoOp);
        }
        require_positive(amount)?;

        let policy = self.policy.resolve()?;
        if !policy.bonus_enabled {
            info!(account = %account, "bonus skipped, bonuses are disabled");
            return Ok(BonusOutcome::NoOp);
        }
        if let Some(cap) = policy.max_bonus_amount {
            if amount > cap {
                return Err(LedgerError::validation(format!(
                    "bonus of {} exceeds the maximum of {}",
                    amount, cap
                )));
            }
        }

        let batch_ttl = policy.batch_ttl(BatchSource::Bonus)?;
        let (transaction, account) = self.runner.run(cancel, policy.lock_timeout(), |unit| {
            let now = Utc::now();
            let refreshed = self.locker.lock_and_adjust(unit, account, amount, false, now)?;

            let tx = Transaction::pending(TransactionType::DailyBonus, None, Some(account), amount)
                .with_metadata(json!({ "description": description }));
            let tx = self.log.record(unit, tx, now)?;

            self.issue_overlay(unit, account, amount, BatchSource::Bonus, tx.id, batch_ttl, now)?;
            Ok((tx, refreshed))
        })?;

        info!(transaction = %transaction.id, amount, "bonus committed");
        Ok(BonusOutcome::Granted { transaction, account })
    }

    // === Reads ===

    pub fn get_balance(&self, account: &AccountId) -> Result<i64> {
        Ok(self.get_account(account)?.balance)
    }

    /// Points expiring within `horizon` (the policy horizon when `None`)
    pub fn get_expiring_points(
        &self,
        account: &AccountId,
        horizon: Option<Duration>,
    ) -> Result<Vec<ExpiringPoints>> {
        self.get_account(account)?;
        let horizon = match horizon {
            Some(h) => h,
            None => self.policy.resolve()?.expiring_horizon()?,
        };
        if horizon <= Duration::zero() {
            return Err(LedgerError::validation("expiry horizon must be positive"));
        }
        self.tracker.upcoming_expirations(account, Utc::now(), horizon)
    }

    pub fn get_transaction(&self, id: Uuid) -> Result<Transaction> {
        self.log.get(id)
    }

    /// Transactions touching `account`, newest first
    pub fn account_history(&self, account: &AccountId, limit: usize) -> Result<Vec<Transaction>> {
        self.get_account(account)?;
        self.log.history(account, limit)
    }

    // === Maintenance ===

    /// Zero out up to `limit` batches that expired before `now`
    ///
    /// Locks the owning accounts in global order first. When the policy has
    /// `deduct_on_expiry`, the expired remainder is also debited from each
    /// balance (never below zero) with a `points_expiry` transaction.
    pub fn sweep_expired_batches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        if limit == 0 {
            return Ok(SweepReport::default());
        }
        let policy = self.policy.resolve()?;
        let candidates = self.tracker.find_expired(now, limit)?;
        if candidates.is_empty() {
            return Ok(SweepReport::default());
        }

        let ids: Vec<Uuid> = candidates.iter().map(|b| b.id).collect();
        let owners: Vec<AccountId> = candidates.iter().map(|b| b.account_id).collect();

        let report = self.runner.run(cancel, policy.lock_timeout(), |unit| {
            let mut locked = self.locker.lock_accounts(unit, &owners)?;
            let expired = self.tracker.expire(unit, &ids, now)?;

            let mut per_account: BTreeMap<AccountId, (i64, usize)> = BTreeMap::new();
            for batch in &expired {
                let entry = per_account.entry(batch.account_id).or_insert((0, 0));
                entry.0 += batch.remaining_amount;
                entry.1 += 1;
            }

            let mut report = SweepReport {
                batches_expired: expired.len(),
                accounts_affected: per_account.len(),
                points_expired: per_account.values().map(|(points, _)| points).sum(),
                points_deducted: 0,
            };

            if policy.deduct_on_expiry {
                for (account, (points, batches)) in &per_account {
                    let Some(balance) = locked.get(account).map(|a| a.balance) else {
                        warn!(account = %account, "expired batches belong to a missing account");
                        continue;
                    };
                    let deduct = balance.min(*points);
                    if deduct <= 0 {
                        continue;
                    }
                    self.locker.adjust_locked(
                        unit,
                        &mut locked,
                        &[Adjustment::expiry(*account, deduct)],
                        now,
                    )?;
                    let tx = Transaction::pending(TransactionType::PointsExpiry, Some(*account), None, deduct)
                        .with_metadata(json!({ "expired_points": points, "batches": batches }));
                    self.log.record(unit, tx, now)?;
                    report.points_deducted += deduct;
                }
            }
            Ok(report)
        })?;

        info!(
            batches = report.batches_expired,
            accounts = report.accounts_affected,
            points = report.points_expired,
            deducted = report.points_deducted,
            "expiry sweep committed"
        );
        Ok(report)
    }

    /// Delete failed idempotency keys whose lifetime has passed
    pub fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.gate.purge_expired(now)?;
        info!(purged, "expired idempotency keys purged");
        Ok(purged)
    }

    // === Account registry ===

    pub fn create_account(&self, id: Option<AccountId>, name: &str) -> Result<Account> {
        let account = Account::new(id.unwrap_or_default(), name.trim());
        account.validate().map_err(LedgerError::validation)?;
        match self.accounts.insert_account(&account) {
            Ok(()) => {
                info!(account = %account.id, "account created");
                Ok(account)
            }
            Err(LedgerError::KeyConflict(_)) => Err(LedgerError::validation(format!(
                "account {} already exists",
                account.id
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn get_account(&self, id: &AccountId) -> Result<Account> {
        self.accounts
            .get_account(id)?
            .ok_or_else(|| LedgerError::not_found(format!("account {}", id)))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.accounts.list_accounts()
    }

    pub fn set_account_active(
        &self,
        id: AccountId,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<Account> {
        let policy = self.policy.resolve()?;
        let account = self.runner.run(cancel, policy.lock_timeout(), |unit| {
            self.locker.set_active(unit, id, active, Utc::now())
        })?;
        info!(account = %id, active, "account status changed");
        Ok(account)
    }

    // === Helpers ===

    /// Gate, run and bind one keyed operation.
    ///
    /// The key is marked failed whenever the unit does not commit.
    fn run_keyed<T>(
        &self,
        key: &str,
        owner: AccountId,
        fingerprint: &str,
        policy: &LedgerPolicy,
        cancel: &CancellationToken,
        work: impl FnOnce(&mut X::Unit) -> Result<(Transaction, T)>,
    ) -> Result<Keyed<T>> {
        let key_ttl = policy.idempotency_ttl()?;
        match self.gate.begin(key, owner, fingerprint, key_ttl, Utc::now())? {
            GateDecision::Replay(tx) => return Ok(Keyed::Replayed(tx)),
            GateDecision::Fresh(_) => {}
        }

        let result = self.runner.run(cancel, policy.lock_timeout(), |unit| {
            let (tx, extra) = work(unit)?;
            self.gate.complete(unit, key, tx.id, Utc::now())?;
            Ok((tx, extra))
        });

        match result {
            Ok((tx, extra)) => Ok(Keyed::Executed(tx, extra)),
            Err(e) => {
                if let Err(fail_err) = self.gate.fail(key, Utc::now()) {
                    warn!(key, "could not mark idempotency key failed: {}", fail_err);
                }
                Err(e)
            }
        }
    }

    fn consume_overlay(
        &self,
        unit: &mut X::Unit,
        account: &AccountId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<ConsumptionReport>> {
        let result = self.tracker.consume(unit, account, amount, now);
        tolerate_overlay(&*unit, result, account, "batch consumption")
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_overlay(
        &self,
        unit: &mut X::Unit,
        account: AccountId,
        amount: i64,
        source: BatchSource,
        source_ref: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            LedgerError::Config(format!("{} batch lifetime is out of range", source.as_str()))
        })?;
        let result = self
            .tracker
            .issue(unit, account, amount, source, Some(source_ref), expires_at, now);
        tolerate_overlay(&*unit, result, &account, "batch issue").map(|_| ())
    }

    fn single_account_outcome(
        &self,
        outcome: Keyed<(Account, Option<ConsumptionReport>)>,
        account: &AccountId,
        message: &str,
    ) -> Result<LedgerOutcome> {
        match outcome {
            Keyed::Executed(transaction, (account, consumption)) => {
                info!(transaction = %transaction.id, tx_type = %transaction.tx_type, amount = transaction.amount, "{}", message);
                Ok(LedgerOutcome {
                    transaction,
                    account,
                    replayed: false,
                    consumption,
                })
            }
            Keyed::Replayed(transaction) => Ok(LedgerOutcome {
                transaction,
                account: self.get_account(account)?,
                replayed: true,
                consumption: None,
            }),
        }
    }
}

/// Idempotency key for an exchange redemption
pub fn exchange_key(account: &AccountId, reference_id: &str) -> String {
    format!("exchange:{}:{}", account, reference_id.trim())
}

/// Keep going after a batch overlay failure unless the store aborted the unit
fn tolerate_overlay<U: UnitOfWork, T>(
    unit: &U,
    result: Result<T>,
    account: &AccountId,
    what: &str,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if unit.is_aborted() => {
            warn!(account = %account, unit = %unit.id(), "{} aborted the unit: {}", what, e);
            Err(LedgerError::CommitFailure(format!("{} failed: {}", what, e)))
        }
        Err(e) => {
            warn!(account = %account, "{} failed, batches left as they were: {}", what, e);
            Ok(None)
        }
    }
}

fn require_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn take_account(accounts: &mut BTreeMap<AccountId, Account>, id: &AccountId) -> Result<Account> {
    accounts
        .remove(id)
        .ok_or_else(|| LedgerError::not_found(format!("account {}", id)))
}
