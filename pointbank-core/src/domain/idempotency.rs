//! Idempotency key domain model

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::result::LedgerError;
use super::AccountId;

/// Lifecycle of an idempotency key
///
/// `pending/processing -> completed | failed`. `completed` is final: the key
/// replays its transaction forever. `failed` keys may be claimed again by a
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Processing => "processing",
            KeyStatus::Completed => "completed",
            KeyStatus::Failed => "failed",
        }
    }
}

impl FromStr for KeyStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(KeyStatus::Pending),
            "processing" => Ok(KeyStatus::Processing),
            "completed" => Ok(KeyStatus::Completed),
            "failed" => Ok(KeyStatus::Failed),
            other => Err(LedgerError::datastore(format!("unknown key status: {}", other))),
        }
    }
}

/// A caller-supplied idempotency key and the outcome it is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub account_id: AccountId,
    pub transaction_id: Option<Uuid>,
    pub status: KeyStatus,
    /// SHA-256 of the logical request inputs
    pub request_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every state change; reclaims compare-and-swap on it
    pub version: i64,
}

impl IdempotencyKey {
    /// New key record in `processing` state
    pub fn processing(
        key: impl Into<String>,
        account_id: AccountId,
        request_hash: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let key = key.into();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            LedgerError::Config(format!("idempotency key {} would expire out of range", key))
        })?;
        Ok(Self {
            key,
            account_id,
            transaction_id: None,
            status: KeyStatus::Processing,
            request_hash: request_hash.into(),
            expires_at,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A retry may take over this key and run the operation again.
    ///
    /// Completed keys never qualify; stale `pending`/`processing` keys do
    /// once their lifetime has passed.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            KeyStatus::Completed => false,
            KeyStatus::Failed => true,
            KeyStatus::Pending | KeyStatus::Processing => self.is_expired(now),
        }
    }
}

/// Fingerprint of a request's logical inputs
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn request_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
