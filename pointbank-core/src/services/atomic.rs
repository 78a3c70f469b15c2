//! Atomic unit executor

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{LedgerError, Result};
use crate::ports::{AtomicExecutor, UnitOfWork};

/// Runs work under a single all-or-nothing boundary
///
/// The unit is handed to the work closure explicitly; everything done
/// through it commits together or not at all. Errors from the work roll the
/// unit back and are returned unchanged. Errors raised by the commit itself
/// become `CommitFailure`.
pub struct AtomicRunner<X> {
    executor: Arc<X>,
}

impl<X: AtomicExecutor> AtomicRunner<X> {
    pub fn new(executor: Arc<X>) -> Self {
        Self { executor }
    }

    pub fn run<T>(
        &self,
        cancel: &CancellationToken,
        lock_timeout: Duration,
        work: impl FnOnce(&mut X::Unit) -> Result<T>,
    ) -> Result<T> {
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }

        let mut unit = self.executor.begin(cancel, lock_timeout)?;
        let unit_id = unit.id();

        let outcome = work(&mut unit).and_then(|value| unit.checkpoint().map(|()| value));
        match outcome {
            Ok(value) => {
                unit.commit().map_err(|e| {
                    warn!(unit = %unit_id, "commit failed: {}", e);
                    LedgerError::CommitFailure(e.to_string())
                })?;
                debug!(unit = %unit_id, "unit committed");
                Ok(value)
            }
            Err(e) => {
                debug!(unit = %unit_id, error = e.code(), "rolling back unit");
                if let Err(rollback_err) = unit.rollback() {
                    warn!(unit = %unit_id, "rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

impl<X> Clone for AtomicRunner<X> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
        }
    }
}
