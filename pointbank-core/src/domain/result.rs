//! Result and error types for the ledger engine

use thiserror::Error;

use super::AccountId;

/// Ledger error taxonomy
///
/// Every balance-affecting path either commits a complete operation or
/// returns one of these with all partial mutations rolled back.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Rejected before any lock is taken (non-positive amount, same-account
    /// transfer, empty idempotency key, key reused for a different request)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("Insufficient balance on account {account}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        balance: i64,
        requested: i64,
    },

    /// Another request holding the same idempotency key is still running.
    /// Callers should back off and poll rather than resubmit.
    #[error("Operation already in progress for idempotency key {0}")]
    DuplicateInProgress(String),

    /// Store-level uniqueness violation on insert
    #[error("Key conflict: {0}")]
    KeyConflict(String),

    #[error("Commit failed: {0}")]
    CommitFailure(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn datastore(msg: impl Into<String>) -> Self {
        Self::Datastore(msg.into())
    }

    /// Whether a caller may resubmit the same request (same idempotency key).
    ///
    /// Retries are always caller-driven; the ledger never loops internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CommitFailure(_) | Self::LockTimeout(_))
    }

    /// Short machine-readable code, used by the CLI JSON output
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::AccountInactive(_) => "account_inactive",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::DuplicateInProgress(_) => "duplicate_in_progress",
            Self::KeyConflict(_) => "key_conflict",
            Self::CommitFailure(_) => "commit_failure",
            Self::LockTimeout(_) => "lock_timeout",
            Self::Cancelled => "cancelled",
            Self::Datastore(_) => "datastore",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Ledger result type
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_retryable_classes() {
        assert!(LedgerError::CommitFailure("disk full".into()).is_retryable());
        assert!(LedgerError::LockTimeout("account".into()).is_retryable());
        assert!(!LedgerError::validation("amount must be positive").is_retryable());
        assert!(!LedgerError::DuplicateInProgress("k1".into()).is_retryable());
    }

    #[test]
    fn test_insufficient_balance_message() {
        let account = AccountId::from(Uuid::nil());
        let err = LedgerError::InsufficientBalance {
            account,
            balance: 100,
            requested: 99999,
        };
        let msg = err.to_string();
        assert!(msg.contains("balance 100"));
        assert!(msg.contains("requested 99999"));
        assert_eq!(err.code(), "insufficient_balance");
    }
}
