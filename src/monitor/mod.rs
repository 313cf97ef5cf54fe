//! Process health monitor.
//!
//! Enumerates OS processes, picks out analysis/training workers, terminates
//! orphaned or overlong ones, and cancels ledger records that no longer have
//! a worker behind them.

pub mod classifier;
pub mod cleanup;
pub mod process;
pub mod reconcile;
pub mod service;
pub mod snapshot;

pub use self::classifier::{ExecutionLinker, KeywordClassifier, Link, ProcessClassifier, RegexLinker};
pub use self::cleanup::{CleanupReason, CleanupReport};
pub use self::process::{ProcessInfo, ProcessTable, Signal, SystemProcessTable};
pub use self::reconcile::ReconcileReport;
pub use self::service::HealthMonitor;
pub use self::snapshot::{HealthSnapshot, ProcessSnapshot};

use thiserror::Error;

use crate::ledger::LedgerError;

/// Monitor failures. Logged by the loop; returned by on-demand operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("process access: {0}")]
    ProcessAccess(String),

    #[error("reconciliation of {execution_id} is ambiguous: {reason}")]
    ReconciliationAmbiguity { execution_id: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("invalid subject pattern: {0}")]
    Pattern(#[from] regex::Error),
}
