//! Ordered account locking and balance adjustment

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Account, AccountId, LedgerError, Result};
use crate::ports::{AccountStore, UnitOfWork};

/// The single global lock order: ascending account id, duplicates removed.
///
/// Every multi-account lock request goes through here, so two operations
/// touching the same accounts always request them in the same order.
pub fn lock_order(ids: &[AccountId]) -> Vec<AccountId> {
    let mut ordered = ids.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

/// One balance change requested of the locker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub account: AccountId,
    pub amount: i64,
    pub is_debit: bool,
    /// Expiry bookkeeping may debit disabled accounts
    pub allow_inactive: bool,
}

impl Adjustment {
    pub fn credit(account: AccountId, amount: i64) -> Self {
        Self {
            account,
            amount,
            is_debit: false,
            allow_inactive: false,
        }
    }

    pub fn debit(account: AccountId, amount: i64) -> Self {
        Self {
            account,
            amount,
            is_debit: true,
            allow_inactive: false,
        }
    }

    pub fn expiry(account: AccountId, amount: i64) -> Self {
        Self {
            allow_inactive: true,
            ..Self::debit(account, amount)
        }
    }
}

/// Locked accounts keyed by id, as last written by the unit
pub type LockedAccounts = BTreeMap<AccountId, Account>;

/// Account store front that enforces the lock ordering rule
pub struct AccountLocker<U> {
    accounts: Arc<dyn AccountStore<U>>,
}

impl<U: UnitOfWork> AccountLocker<U> {
    pub fn new(accounts: Arc<dyn AccountStore<U>>) -> Self {
        Self { accounts }
    }

    /// Lock every account in `ids` in global order, then read them.
    ///
    /// All locks are held before the first row is read. Accounts that do not
    /// exist are absent from the result.
    pub fn lock_accounts(&self, unit: &mut U, ids: &[AccountId]) -> Result<LockedAccounts> {
        let ordered = lock_order(ids);
        for id in &ordered {
            unit.checkpoint()?;
            self.accounts.lock_account(unit, id)?;
        }
        debug!(unit = %unit.id(), count = ordered.len(), "accounts locked");

        let mut locked = LockedAccounts::new();
        for id in ordered {
            if let Some(account) = self.accounts.get_locked(unit, &id)? {
                locked.insert(id, account);
            }
        }
        Ok(locked)
    }

    /// Apply `adjustments` to already locked accounts and write the results.
    ///
    /// Checks every adjustment before writing anything: missing accounts fail
    /// with `NotFound`, disabled ones with `AccountInactive`, and a debit that
    /// would go below zero with `InsufficientBalance`.
    pub fn adjust_locked(
        &self,
        unit: &mut U,
        locked: &mut LockedAccounts,
        adjustments: &[Adjustment],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut balances: BTreeMap<AccountId, i64> = BTreeMap::new();

        for adj in adjustments {
            if adj.amount <= 0 {
                return Err(LedgerError::validation("adjustment amount must be positive"));
            }
            let account = locked
                .get(&adj.account)
                .ok_or_else(|| LedgerError::not_found(format!("account {}", adj.account)))?;
            if !account.is_active && !adj.allow_inactive {
                return Err(LedgerError::AccountInactive(adj.account));
            }

            let balance = balances.entry(adj.account).or_insert(account.balance);
            if adj.is_debit {
                if *balance < adj.amount {
                    return Err(LedgerError::InsufficientBalance {
                        account: adj.account,
                        balance: *balance,
                        requested: adj.amount,
                    });
                }
                *balance -= adj.amount;
            } else {
                *balance = balance.checked_add(adj.amount).ok_or_else(|| {
                    LedgerError::validation(format!("balance overflow on account {}", adj.account))
                })?;
            }
        }

        // Written in lock order
        for (id, balance) in balances {
            self.accounts.write_balance(unit, &id, balance, at)?;
            if let Some(account) = locked.get_mut(&id) {
                account.balance = balance;
                account.updated_at = at;
            }
        }
        Ok(())
    }

    /// Lock and adjust several accounts as one call
    pub fn lock_and_adjust_all(
        &self,
        unit: &mut U,
        adjustments: &[Adjustment],
        at: DateTime<Utc>,
    ) -> Result<LockedAccounts> {
        let ids: Vec<AccountId> = adjustments.iter().map(|a| a.account).collect();
        let mut locked = self.lock_accounts(unit, &ids)?;
        self.adjust_locked(unit, &mut locked, adjustments, at)?;
        Ok(locked)
    }

    /// Lock and adjust one account, returning it refreshed
    pub fn lock_and_adjust(
        &self,
        unit: &mut U,
        account: AccountId,
        amount: i64,
        is_debit: bool,
        at: DateTime<Utc>,
    ) -> Result<Account> {
        let adjustment = if is_debit {
            Adjustment::debit(account, amount)
        } else {
            Adjustment::credit(account, amount)
        };
        let mut locked = self.lock_and_adjust_all(unit, &[adjustment], at)?;
        locked
            .remove(&account)
            .ok_or_else(|| LedgerError::not_found(format!("account {}", account)))
    }

    /// Lock one account and flip its active flag
    pub fn set_active(
        &self,
        unit: &mut U,
        account: AccountId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Account> {
        let mut locked = self.lock_accounts(unit, &[account])?;
        let mut current = locked
            .remove(&account)
            .ok_or_else(|| LedgerError::not_found(format!("account {}", account)))?;
        if current.is_active != active {
            self.accounts.write_active(unit, &account, active, at)?;
            current.is_active = active;
            current.updated_at = at;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryStore, MemoryUnit};
    use crate::ports::AtomicExecutor;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup(balances: &[(i64, bool)]) -> (Arc<MemoryStore>, Vec<AccountId>) {
        let store = Arc::new(MemoryStore::new());
        let ids = balances
            .iter()
            .map(|(balance, active)| {
                let mut account = Account::new(AccountId::new(), "acct");
                account.balance = *balance;
                account.is_active = *active;
                store.insert_account(&account).unwrap();
                account.id
            })
            .collect();
        (store, ids)
    }

    fn unit(store: &MemoryStore) -> MemoryUnit {
        store
            .begin(&CancellationToken::new(), Duration::from_millis(200))
            .unwrap()
    }

    #[test]
    fn test_lock_order_sorts_and_dedups() {
        let a: AccountId = "00000000-0000-0000-0000-00000000000a".parse().unwrap();
        let b: AccountId = "00000000-0000-0000-0000-00000000000b".parse().unwrap();
        assert_eq!(lock_order(&[b, a, b]), vec![a, b]);
        assert_eq!(lock_order(&[a, b]), lock_order(&[b, a]));
    }

    #[test]
    fn test_transfer_pair_adjusts_both() {
        let (store, ids) = setup(&[(1000, true), (0, true)]);
        let locker = AccountLocker::new(store.clone() as Arc<dyn AccountStore<MemoryUnit>>);
        let mut u = unit(&store);

        let locked = locker
            .lock_and_adjust_all(
                &mut u,
                &[Adjustment::debit(ids[0], 300), Adjustment::credit(ids[1], 300)],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(locked[&ids[0]].balance, 700);
        assert_eq!(locked[&ids[1]].balance, 300);
    }

    #[test]
    fn test_insufficient_balance_writes_nothing() {
        let (store, ids) = setup(&[(100, true)]);
        let locker = AccountLocker::new(store.clone() as Arc<dyn AccountStore<MemoryUnit>>);
        let mut u = unit(&store);

        let err = locker
            .lock_and_adjust(&mut u, ids[0], 99999, true, Utc::now())
            .unwrap_err();
        match err {
            LedgerError::InsufficientBalance { balance, requested, .. } => {
                assert_eq!(balance, 100);
                assert_eq!(requested, 99999);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            store.get_locked(&mut u, &ids[0]).unwrap().unwrap().balance,
            100
        );
    }

    #[test]
    fn test_inactive_and_missing_accounts() {
        let (store, ids) = setup(&[(100, false)]);
        let locker = AccountLocker::new(store.clone() as Arc<dyn AccountStore<MemoryUnit>>);
        let mut u = unit(&store);

        let err = locker.lock_and_adjust(&mut u, ids[0], 10, false, Utc::now()).unwrap_err();
        assert!(matches!(err, LedgerError::AccountInactive(_)));

        let mut locked = locker.lock_accounts(&mut u, &ids).unwrap();
        locker
            .adjust_locked(&mut u, &mut locked, &[Adjustment::expiry(ids[0], 10)], Utc::now())
            .unwrap();
        assert_eq!(locked[&ids[0]].balance, 90);

        let err = locker
            .lock_and_adjust(&mut u, AccountId::new(), 10, false, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
