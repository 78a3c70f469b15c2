//! Point batch domain model
//!
//! Batches are an accounting overlay on top of account balances: they track
//! where points came from and when they expire so that spending can be
//! applied oldest-first. The account balance stays the source of truth.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::LedgerError;
use super::AccountId;

/// Where a batch of points came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    AdminGrant,
    Transfer,
    Bonus,
    ExchangeRefund,
}

impl BatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchSource::AdminGrant => "admin_grant",
            BatchSource::Transfer => "transfer",
            BatchSource::Bonus => "bonus",
            BatchSource::ExchangeRefund => "exchange_refund",
        }
    }
}

impl FromStr for BatchSource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin_grant" => Ok(BatchSource::AdminGrant),
            "transfer" => Ok(BatchSource::Transfer),
            "bonus" => Ok(BatchSource::Bonus),
            "exchange_refund" => Ok(BatchSource::ExchangeRefund),
            other => Err(LedgerError::datastore(format!("unknown batch source: {}", other))),
        }
    }
}

/// A discrete, independently expiring allotment of points
///
/// `0 <= remaining_amount <= original_amount`, and `remaining_amount` only
/// ever decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointBatch {
    pub id: Uuid,
    pub account_id: AccountId,
    pub original_amount: i64,
    pub remaining_amount: i64,
    pub source: BatchSource,
    /// Transaction that produced this batch
    pub source_ref: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PointBatch {
    pub fn issue(
        account_id: AccountId,
        amount: i64,
        source: BatchSource,
        source_ref: Option<Uuid>,
        expires_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            original_amount: amount,
            remaining_amount: amount,
            source,
            source_ref,
            expires_at,
            created_at,
        }
    }

    /// Eligible for FIFO consumption at `now`
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        self.remaining_amount > 0 && self.expires_at > now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Take up to `amount` points from this batch, returning how many were taken
    pub fn take(&mut self, amount: i64) -> i64 {
        let taken = amount.clamp(0, self.remaining_amount);
        self.remaining_amount -= taken;
        taken
    }
}

/// Outcome of a FIFO consumption pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumptionReport {
    pub requested: i64,
    pub consumed: i64,
    /// Requested points no unexpired batch could cover
    pub shortfall: i64,
    /// (batch id, points taken) in consumption order
    pub touched: Vec<(Uuid, i64)>,
}

/// Outcome of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub batches_expired: usize,
    pub accounts_affected: usize,
    pub points_expired: i64,
    /// Balance actually debited when expiry deduction is enabled
    pub points_deducted: i64,
}

/// A "points expiring soon" projection row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiringPoints {
    pub batch_id: Uuid,
    pub amount: i64,
    pub source: BatchSource,
    pub expires_at: DateTime<Utc>,
}

impl From<&PointBatch> for ExpiringPoints {
    fn from(batch: &PointBatch) -> Self {
        Self {
            batch_id: batch.id,
            amount: batch.remaining_amount,
            source: batch.source,
            expires_at: batch.expires_at,
        }
    }
}
