//! Transaction log domain model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::result::LedgerError;
use super::AccountId;

/// Kind of balance-affecting event recorded in the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    AdminGrant,
    AdminDeduct,
    DailyBonus,
    ExchangeConsumption,
    PointsExpiry,
}

impl TransactionType {
    pub const ALL: [TransactionType; 6] = [
        TransactionType::Transfer,
        TransactionType::AdminGrant,
        TransactionType::AdminDeduct,
        TransactionType::DailyBonus,
        TransactionType::ExchangeConsumption,
        TransactionType::PointsExpiry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Transfer => "transfer",
            TransactionType::AdminGrant => "admin_grant",
            TransactionType::AdminDeduct => "admin_deduct",
            TransactionType::DailyBonus => "daily_bonus",
            TransactionType::ExchangeConsumption => "exchange_consumption",
            TransactionType::PointsExpiry => "points_expiry",
        }
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LedgerError::datastore(format!("unknown transaction type: {}", s)))
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status: `pending -> completed`, terminal once set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(LedgerError::datastore(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// A single entry in the transaction log
///
/// Both accounts absent means a pure system operation. For a completed
/// transaction, `amount` equals the balance decrease on `from_account` and the
/// balance increase on `to_account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
    pub amount: i64,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub idempotency_key: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a new pending transaction
    pub fn pending(
        tx_type: TransactionType,
        from_account: Option<AccountId>,
        to_account: Option<AccountId>,
        amount: i64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            from_account,
            to_account,
            amount,
            tx_type,
            status: TransactionStatus::Pending,
            idempotency_key: None,
            metadata: JsonValue::Object(Default::default()),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<&str>) -> Self {
        self.idempotency_key = key.map(str::to_string);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Transition `pending -> completed`
    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(LedgerError::validation(format!(
                "transaction {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = TransactionStatus::Completed;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }

    /// Signed balance change this transaction caused on `account`
    pub fn net_effect_on(&self, account: &AccountId) -> i64 {
        if !self.is_completed() {
            return 0;
        }
        let mut delta = 0;
        if self.to_account.as_ref() == Some(account) {
            delta += self.amount;
        }
        if self.from_account.as_ref() == Some(account) {
            delta -= self.amount;
        }
        delta
    }
}
