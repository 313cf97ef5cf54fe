//! Execution Ledger -- durable record of job lifecycle, steps, and errors.
//!
//! The ledger is the only state shared between the scheduler, the process
//! health monitor, and worker processes. Every mutation runs as one SQLite
//! `BEGIN IMMEDIATE` transaction scoped to a single execution id; steps,
//! errors, and subjects live in child tables so concurrent appends are merged
//! row by row.

pub mod cancel;
pub mod id;
pub mod model;
mod store;

pub use self::cancel::CancellationHandle;
pub use self::model::{
    ErrorEntry, ExecutionPatch, ExecutionRecord, ExecutionStatistics, ExecutionStatus,
    ExecutionSummary, ExecutionType, ListFilter, NewExecution, NewStep, PruneReport,
    ResourceStats, Step, StepStatus, Subject, TypeStatistics,
};
pub use self::store::ExecutionLedger;

use thiserror::Error;

/// Errors surfaced by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("execution {0} not found")]
    NotFound(String),

    #[error("execution {execution_id}: transition {from} -> {to} not allowed")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// True for errors that mean the source of truth itself failed.
    pub fn is_storage(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        LedgerError::Storage(value.to_string())
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(value: r2d2::Error) -> Self {
        LedgerError::Storage(format!("connection pool: {}", value))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(value: serde_json::Error) -> Self {
        LedgerError::Storage(format!("encoding: {}", value))
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(value: tokio::task::JoinError) -> Self {
        LedgerError::Storage(format!("ledger task aborted: {}", value))
    }
}
