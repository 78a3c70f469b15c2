//! Keyed exclusive row locks
//!
//! Each row key maps to its own mutex, so rows never contend with each
//! other. A unit of work collects the guards it acquires in `HeldLocks` and
//! releases all of them together when it finishes (two-phase locking).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{AccountId, LedgerError, Result};

/// Upper bound on a single wait slice, so cancellation is noticed promptly
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

type RowGuard = ArcMutexGuard<RawMutex, ()>;

/// Row key for an account
pub fn account_row(id: &AccountId) -> String {
    format!("accounts/{}", id)
}

/// Shared table of row locks
#[derive(Default)]
pub struct RowLocks {
    rows: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut rows = self.rows.lock();
        Arc::clone(
            rows.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Locks held by one unit of work
pub struct HeldLocks {
    guards: HashMap<String, RowGuard>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl HeldLocks {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            guards: HashMap::new(),
            timeout,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn holds(&self, key: &str) -> bool {
        self.guards.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.guards.len()
    }

    /// Block until `key` is locked, the timeout elapses, or the unit is
    /// cancelled. Re-acquiring a key this unit already holds is a no-op.
    pub fn acquire(&mut self, table: &RowLocks, key: &str) -> Result<()> {
        if self.guards.contains_key(key) {
            return Ok(());
        }

        let slot = table.slot(key);
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LedgerError::LockTimeout(key.to_string()));
            }
            let wait = (deadline - now).min(LOCK_POLL_INTERVAL);
            if let Some(guard) = slot.try_lock_arc_for(wait) {
                debug!(row = key, "row lock acquired");
                self.guards.insert(key.to_string(), guard);
                return Ok(());
            }
        }
    }

    /// Fail unless this unit holds `key`
    pub fn require(&self, key: &str) -> Result<()> {
        if self.holds(key) {
            Ok(())
        } else {
            Err(LedgerError::datastore(format!("row {} is not locked by this unit", key)))
        }
    }

    pub fn release_all(&mut self) {
        self.guards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reacquire_is_noop() {
        let table = RowLocks::new();
        let mut held = HeldLocks::new(CancellationToken::new(), Duration::from_millis(100));
        held.acquire(&table, "accounts/a").unwrap();
        held.acquire(&table, "accounts/a").unwrap();
        assert_eq!(held.len(), 1);
        assert!(held.require("accounts/a").is_ok());
        assert!(held.require("accounts/b").is_err());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let table = Arc::new(RowLocks::new());
        let mut first = HeldLocks::new(CancellationToken::new(), Duration::from_millis(100));
        first.acquire(&table, "accounts/a").unwrap();

        let table2 = Arc::clone(&table);
        let err = thread::spawn(move || {
            let mut second = HeldLocks::new(CancellationToken::new(), Duration::from_millis(60));
            second.acquire(&table2, "accounts/a").unwrap_err()
        })
        .join()
        .unwrap();
        assert!(matches!(err, LedgerError::LockTimeout(_)));

        // Disjoint rows do not contend
        let mut third = HeldLocks::new(CancellationToken::new(), Duration::from_millis(60));
        third.acquire(&table, "accounts/b").unwrap();
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let table = Arc::new(RowLocks::new());
        let mut first = HeldLocks::new(CancellationToken::new(), Duration::from_secs(1));
        first.acquire(&table, "accounts/a").unwrap();

        let table2 = Arc::clone(&table);
        let waiter = thread::spawn(move || {
            let mut second = HeldLocks::new(CancellationToken::new(), Duration::from_secs(5));
            second.acquire(&table2, "accounts/a")
        });

        thread::sleep(Duration::from_millis(50));
        first.release_all();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_cancelled_wait() {
        let table = RowLocks::new();
        let mut first = HeldLocks::new(CancellationToken::new(), Duration::from_secs(1));
        first.acquire(&table, "accounts/a").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut second = HeldLocks::new(cancel, Duration::from_secs(5));
        let err = second.acquire(&table, "accounts/a").unwrap_err();
        assert!(matches!(err, LedgerError::Cancelled));
    }
}
