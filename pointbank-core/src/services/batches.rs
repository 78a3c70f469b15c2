//! Point batch tracking: issuance, FIFO consumption, expiry

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    AccountId, BatchSource, ConsumptionReport, ExpiringPoints, LedgerError, PointBatch, Result,
};
use crate::ports::PointBatchStore;

pub struct PointBatchTracker<U> {
    store: Arc<dyn PointBatchStore<U>>,
}

impl<U> PointBatchTracker<U> {
    pub fn new(store: Arc<dyn PointBatchStore<U>>) -> Self {
        Self { store }
    }

    /// Insert a new batch with `remaining = original = amount`
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        &self,
        unit: &mut U,
        account: AccountId,
        amount: i64,
        source: BatchSource,
        source_ref: Option<Uuid>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PointBatch> {
        if amount <= 0 {
            return Err(LedgerError::validation("batch amount must be positive"));
        }
        let batch = PointBatch::issue(account, amount, source, source_ref, expires_at, now);
        self.store.insert_batch(unit, &batch)?;
        debug!(batch = %batch.id, account = %account, source = source.as_str(), "batch issued");
        Ok(batch)
    }

    /// Spend `amount` from the account's unexpired batches, oldest first.
    ///
    /// Stops when the batches run out. The uncovered part is reported as the
    /// shortfall; the account balance stays the source of truth.
    pub fn consume(
        &self,
        unit: &mut U,
        account: &AccountId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumptionReport> {
        let mut report = ConsumptionReport {
            requested: amount,
            ..Default::default()
        };
        let mut outstanding = amount.max(0);

        for mut batch in self.store.consumable_batches(unit, account, now)? {
            if outstanding == 0 {
                break;
            }
            if !batch.is_consumable(now) {
                continue;
            }
            let taken = batch.take(outstanding);
            if taken == 0 {
                continue;
            }
            self.store.set_remaining(unit, batch.id, batch.remaining_amount)?;
            report.touched.push((batch.id, taken));
            report.consumed += taken;
            outstanding -= taken;
        }

        report.shortfall = outstanding;
        if outstanding > 0 {
            warn!(
                account = %account,
                requested = amount,
                shortfall = outstanding,
                "batches did not cover the consumed amount"
            );
        }
        Ok(report)
    }

    /// Batches with points left expiring within `horizon` of `now`
    pub fn upcoming_expirations(
        &self,
        account: &AccountId,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<ExpiringPoints>> {
        let until = now
            .checked_add_signed(horizon)
            .ok_or_else(|| LedgerError::validation("expiry horizon is out of range"))?;
        let batches = self.store.batches_expiring_between(account, now, until)?;
        Ok(batches.iter().map(ExpiringPoints::from).collect())
    }

    pub fn find_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PointBatch>> {
        self.store.find_expired(now, limit)
    }

    /// Force `remaining = 0` on the given batches that are still expired
    pub fn expire(&self, unit: &mut U, ids: &[Uuid], now: DateTime<Utc>) -> Result<Vec<PointBatch>> {
        self.store.expire_batches(unit, ids, now)
    }
}
