//! Idempotency gate

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    AccountId, IdempotencyKey, KeyStatus, LedgerError, Result, Transaction,
};
use crate::ports::{IdempotencyStore, TransactionStore};

/// What the gate decided for a request
#[derive(Debug)]
pub enum GateDecision {
    /// The caller owns the key and must run the operation
    Fresh(IdempotencyKey),
    /// The key already completed; return this transaction without re-running
    Replay(Transaction),
}

/// Maps a caller-supplied key to at most one completed outcome
///
/// The key record is written before the atomic unit opens, bound to its
/// transaction inside the unit, and marked failed after a rollback so a
/// retry may claim it again.
pub struct IdempotencyGate<U> {
    keys: Arc<dyn IdempotencyStore<U>>,
    transactions: Arc<dyn TransactionStore<U>>,
}

impl<U> IdempotencyGate<U> {
    pub fn new(keys: Arc<dyn IdempotencyStore<U>>, transactions: Arc<dyn TransactionStore<U>>) -> Self {
        Self { keys, transactions }
    }

    pub fn begin(
        &self,
        key: &str,
        owner: AccountId,
        request_hash: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        if key.trim().is_empty() {
            return Err(LedgerError::validation("idempotency key must not be empty"));
        }

        let Some(existing) = self.keys.get_key(key)? else {
            let record = IdempotencyKey::processing(key, owner, request_hash, ttl, now)?;
            return match self.keys.insert_key(&record) {
                Ok(()) => {
                    debug!(key, "idempotency key claimed");
                    Ok(GateDecision::Fresh(record))
                }
                // A concurrent caller inserted first
                Err(LedgerError::KeyConflict(_)) => {
                    Err(LedgerError::DuplicateInProgress(key.to_string()))
                }
                Err(e) => Err(e),
            };
        };

        // A completed key is bound to its request for good
        let binding = existing.status == KeyStatus::Completed || !existing.is_expired(now);
        if binding && existing.request_hash != request_hash {
            return Err(LedgerError::validation(format!(
                "idempotency key {} was already used for a different request",
                key
            )));
        }

        if existing.status == KeyStatus::Completed {
            return self.replay(&existing).map(GateDecision::Replay);
        }
        if !existing.is_reclaimable(now) {
            return Err(LedgerError::DuplicateInProgress(key.to_string()));
        }
        self.reclaim(&existing, owner, request_hash, ttl, now)
    }

    fn replay(&self, existing: &IdempotencyKey) -> Result<Transaction> {
        let key = existing.key.as_str();
        let tx_id = existing.transaction_id.ok_or_else(|| {
            LedgerError::datastore(format!("completed key {} has no transaction", key))
        })?;
        let tx = self.transactions.get_transaction(tx_id)?.ok_or_else(|| {
            LedgerError::datastore(format!("key {} points at missing transaction {}", key, tx_id))
        })?;
        debug!(key, transaction = %tx.id, "replaying completed request");
        Ok(tx)
    }

    fn reclaim(
        &self,
        existing: &IdempotencyKey,
        owner: AccountId,
        request_hash: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        let mut replacement = IdempotencyKey::processing(&existing.key, owner, request_hash, ttl, now)?;
        if !self.keys.reclaim_key(existing, &replacement)? {
            // Someone else reclaimed it between our read and the swap
            return Err(LedgerError::DuplicateInProgress(existing.key.clone()));
        }
        replacement.version = existing.version + 1;
        debug!(key = %existing.key, previous = existing.status.as_str(), "idempotency key reclaimed");
        Ok(GateDecision::Fresh(replacement))
    }

    /// Bind the key to its transaction inside the operation's unit
    pub fn complete(&self, unit: &mut U, key: &str, transaction_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.keys.complete_key(unit, key, transaction_id, at)
    }

    /// Mark the key failed after the unit rolled back
    pub fn fail(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.keys.fail_key(key, at)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.keys.purge_expired_keys(now)
    }
}
