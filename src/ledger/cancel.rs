//! Cooperative cancellation for job runners.
//!
//! Nothing in this crate interrupts a worker directly. A runner holds a
//! [`CancellationHandle`] and polls it; the ledger only guarantees that a
//! `Cancelled` status eventually becomes observable.

use std::time::Duration;

use tracing::warn;

use super::{ExecutionLedger, ExecutionStatus, LedgerError};

/// Per-execution view of the ledger's cancellation state.
#[derive(Clone)]
pub struct CancellationHandle {
    ledger: ExecutionLedger,
    execution_id: String,
}

impl CancellationHandle {
    pub fn new(ledger: ExecutionLedger, execution_id: impl Into<String>) -> Self {
        Self {
            ledger,
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// True once the record has been moved to `Cancelled`.
    pub async fn is_cancelled(&self) -> Result<bool, LedgerError> {
        Ok(self.ledger.status(&self.execution_id).await? == ExecutionStatus::Cancelled)
    }

    /// Resolve once `Cancelled` is observed, polling every `poll`.
    ///
    /// Storage errors are logged and polling continues. A record that
    /// disappears (pruned) counts as cancelled.
    pub async fn wait_cancelled(&self, poll: Duration) {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            match self.is_cancelled().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(LedgerError::NotFound(_)) => return,
                Err(e) => {
                    warn!(execution_id = %self.execution_id, error = %e, "cancellation poll failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExecutionPatch, ExecutionType, NewExecution};
    use crate::storage::open_pool;

    #[tokio::test]
    async fn test_cancel_becomes_observable() {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = ExecutionLedger::new(open_pool(dir.path().join("l.db")).unwrap());
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledTraining, "BTC", "test"))
            .await
            .unwrap();
        ledger
            .transition(&id, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();

        let handle = CancellationHandle::new(ledger.clone(), &id);
        assert!(!handle.is_cancelled().await.unwrap());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_cancelled(Duration::from_millis(10)).await })
        };
        ledger.cancel(&id, "operator", "manual reset").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancellation was not observed")
            .unwrap();
        assert!(handle.is_cancelled().await.unwrap());
    }
}
