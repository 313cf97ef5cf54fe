//! Recurring job scheduler.
//!
//! Tasks are defined in configuration, their runtime state lives in the
//! `scheduled_tasks` table, and every dispatch is recorded in the execution
//! ledger.

pub mod engine;
pub mod profiles;
pub mod runner;
pub mod store;
pub mod task;

pub use self::engine::{DispatchOutcome, Scheduler, SchedulerService};
pub use self::runner::{CommandJobRunner, JobRequest, JobRunner};
pub use self::store::{PlannedRun, TaskStore};
pub use self::task::{Frequency, ScheduledTask, TaskDefinition, TaskType};

use thiserror::Error;

use crate::ledger::LedgerError;

/// Failure of a single dispatch. Recorded into the execution record; never
/// stops the tick loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("job runner failed: {0}")]
    Runner(String),

    #[error("task store: {0}")]
    TaskStore(String),

    #[error("dispatch limiter closed")]
    LimiterClosed,
}
