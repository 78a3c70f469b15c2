//! Ledger policy - tunables resolved once per operation

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::result::{LedgerError, Result};
use super::BatchSource;

/// Longest batch lifetime or expiry horizon, in days
pub const MAX_DAYS: i64 = 36_500;
/// Longest idempotency key lifetime, in hours
pub const MAX_KEY_TTL_HOURS: i64 = 87_600;
/// Longest a lock request may wait, in milliseconds
pub const MAX_LOCK_TIMEOUT_MS: u64 = 600_000;

/// Batch lifetimes in days, per source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchTtlDays {
    pub admin_grant: i64,
    pub transfer: i64,
    pub bonus: i64,
    pub exchange_refund: i64,
}

impl Default for BatchTtlDays {
    fn default() -> Self {
        Self {
            admin_grant: 365,
            transfer: 365,
            bonus: 30,
            exchange_refund: 365,
        }
    }
}

/// Ledger policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerPolicy {
    pub batch_ttl_days: BatchTtlDays,
    pub idempotency_ttl_hours: i64,
    /// "Expiring soon" horizon for user-facing reports
    pub expiring_horizon_days: i64,
    /// How long a lock request waits before giving up
    pub lock_timeout_ms: u64,
    pub bonus_enabled: bool,
    pub max_bonus_amount: Option<i64>,
    /// Debit expired batch remainders from the balance during sweeps
    pub deduct_on_expiry: bool,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            batch_ttl_days: BatchTtlDays::default(),
            idempotency_ttl_hours: 24,
            expiring_horizon_days: 30,
            lock_timeout_ms: 5_000,
            bonus_enabled: true,
            max_bonus_amount: None,
            deduct_on_expiry: false,
        }
    }
}

impl LedgerPolicy {
    pub fn batch_ttl(&self, source: BatchSource) -> Result<Duration> {
        let days = match source {
            BatchSource::AdminGrant => self.batch_ttl_days.admin_grant,
            BatchSource::Transfer => self.batch_ttl_days.transfer,
            BatchSource::Bonus => self.batch_ttl_days.bonus,
            BatchSource::ExchangeRefund => self.batch_ttl_days.exchange_refund,
        };
        bounded_days(&format!("batch_ttl_days.{}", source.as_str()), days)
    }

    pub fn idempotency_ttl(&self) -> Result<Duration> {
        check_range("idempotency_ttl_hours", self.idempotency_ttl_hours, MAX_KEY_TTL_HOURS)?;
        Duration::try_hours(self.idempotency_ttl_hours)
            .ok_or_else(|| LedgerError::Config("idempotency_ttl_hours is out of range".into()))
    }

    pub fn expiring_horizon(&self) -> Result<Duration> {
        bounded_days("expiring_horizon_days", self.expiring_horizon_days)
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms.min(MAX_LOCK_TIMEOUT_MS))
    }

    /// Check every tunable is in range
    pub fn validate(&self) -> Result<()> {
        for source in [
            BatchSource::AdminGrant,
            BatchSource::Transfer,
            BatchSource::Bonus,
            BatchSource::ExchangeRefund,
        ] {
            self.batch_ttl(source)?;
        }
        self.idempotency_ttl()?;
        self.expiring_horizon()?;
        if self.lock_timeout_ms == 0 || self.lock_timeout_ms > MAX_LOCK_TIMEOUT_MS {
            return Err(LedgerError::Config(format!(
                "lock_timeout_ms must be between 1 and {}, got {}",
                MAX_LOCK_TIMEOUT_MS, self.lock_timeout_ms
            )));
        }
        if let Some(cap) = self.max_bonus_amount {
            if cap <= 0 {
                return Err(LedgerError::Config(format!(
                    "max_bonus_amount must be positive, got {}",
                    cap
                )));
            }
        }
        Ok(())
    }

    /// Apply a single `key = value` override (settings table rows)
    ///
    /// Unknown keys are ignored so newer settings do not break older binaries.
    /// The policy is left unchanged when the value does not parse or is out
    /// of range.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| LedgerError::Config(format!("invalid value for {}: {}", key, value)))
        }

        let mut next = self.clone();
        match key {
            "batch_ttl_days.admin_grant" => next.batch_ttl_days.admin_grant = parse(key, value)?,
            "batch_ttl_days.transfer" => next.batch_ttl_days.transfer = parse(key, value)?,
            "batch_ttl_days.bonus" => next.batch_ttl_days.bonus = parse(key, value)?,
            "batch_ttl_days.exchange_refund" => {
                next.batch_ttl_days.exchange_refund = parse(key, value)?
            }
            "idempotency_ttl_hours" => next.idempotency_ttl_hours = parse(key, value)?,
            "expiring_horizon_days" => next.expiring_horizon_days = parse(key, value)?,
            "lock_timeout_ms" => next.lock_timeout_ms = parse(key, value)?,
            "bonus_enabled" => next.bonus_enabled = parse(key, value)?,
            "max_bonus_amount" => {
                next.max_bonus_amount = match value.trim() {
                    "" | "none" => None,
                    v => Some(parse(key, v)?),
                }
            }
            "deduct_on_expiry" => next.deduct_on_expiry = parse(key, value)?,
            _ => return Ok(()),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn check_range(name: &str, value: i64, max: i64) -> Result<()> {
    if value <= 0 || value > max {
        return Err(LedgerError::Config(format!(
            "{} must be between 1 and {}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

fn bounded_days(name: &str, days: i64) -> Result<Duration> {
    check_range(name, days, MAX_DAYS)?;
    Duration::try_days(days).ok_or_else(|| LedgerError::Config(format!("{} is out of range", name)))
}
