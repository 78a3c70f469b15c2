//! Unit-of-work port - the all-or-nothing execution boundary

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{LedgerError, Result};

/// A work-scoped handle passed explicitly through every call that must take
/// part in the same atomic unit.
///
/// Row locks taken through a unit are held until it is committed or rolled
/// back. Dropping a unit without committing rolls it back.
pub trait UnitOfWork {
    fn id(&self) -> Uuid;

    /// Cancellation signal supplied by the caller when the unit was opened
    fn cancel_token(&self) -> &CancellationToken;

    /// Fail fast if the caller has cancelled the operation
    fn checkpoint(&self) -> Result<()> {
        if self.cancel_token().is_cancelled() {
            Err(LedgerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The datastore rejected a statement and will refuse to commit this
    /// unit. Stores whose transactions survive a failed statement never
    /// report this.
    fn is_aborted(&self) -> bool {
        false
    }

    fn commit(self) -> Result<()>
    where
        Self: Sized;

    fn rollback(self) -> Result<()>
    where
        Self: Sized;
}

/// Opens atomic units against a datastore
pub trait AtomicExecutor: Send + Sync {
    type Unit: UnitOfWork + 'static;

    /// Begin a unit. Lock requests made through it give up after
    /// `lock_timeout` or as soon as `cancel` fires.
    fn begin(&self, cancel: &CancellationToken, lock_timeout: Duration) -> Result<Self::Unit>;
}
