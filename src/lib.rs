//! jobwarden -- execution ledger, scheduler, and process health monitor for
//! long-running backtest and training jobs.
//!
//! Three cooperating parts share one SQLite database: the ledger records
//! every job's lifecycle, the scheduler dispatches recurring jobs to an
//! external worker program, and the monitor cleans up workers that outlive
//! their parent or their time budget.

pub mod config;
pub mod ledger;
pub mod logging;
pub mod monitor;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::JobwardenConfig;
use crate::ledger::ExecutionLedger;
use crate::monitor::HealthMonitor;
use crate::scheduler::{CommandJobRunner, Scheduler, SchedulerService, TaskStore};

/// Interval of the retention prune in `serve`.
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Which background services `serve` starts.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub scheduler: bool,
    pub monitor: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            scheduler: true,
            monitor: true,
        }
    }
}

/// Build the scheduler for `config` over an open ledger.
pub fn build_scheduler(config: &JobwardenConfig, ledger: ExecutionLedger) -> Scheduler {
    let tasks = TaskStore::new(
        ledger.pool().clone(),
        config.tasks.clone(),
        config.scheduler.default_max_failures,
    );
    let runner = CommandJobRunner::new(
        &config.runner,
        Duration::from_secs(config.monitor.termination_grace_secs),
    );
    Scheduler::new(
        ledger,
        tasks,
        Arc::new(runner),
        config.scheduler.max_concurrent_dispatches,
    )
}

/// Run the daemon until ctrl-c: scheduler loop, monitor loop, and a daily
/// retention prune.
pub async fn serve(config: JobwardenConfig, options: ServeOptions) -> Result<()> {
    info!(db_path = %config.storage.db_path.display(), "initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let ledger = ExecutionLedger::new(pool);

    let scheduler_service = if options.scheduler && config.scheduler.enabled {
        let service = SchedulerService::new(
            build_scheduler(&config, ledger.clone()),
            Duration::from_secs(config.scheduler.tick_interval_secs),
        );
        service.start();
        Some(service)
    } else {
        info!("scheduler disabled");
        None
    };

    let monitor = if options.monitor && config.monitor.enabled {
        let monitor = HealthMonitor::from_config(ledger.clone(), &config.monitor)
            .context("failed to build health monitor")?;
        monitor.start();
        Some(monitor)
    } else {
        info!("health monitor disabled");
        None
    };

    let retention_days = config.storage.retention_days;
    let pruner = (retention_days > 0).then(|| {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = ledger.prune(retention_days).await {
                    error!(error = %e, "retention prune failed");
                }
            }
        })
    });

    info!("jobwarden running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    if let Some(pruner) = pruner {
        pruner.abort();
    }
    if let Some(service) = scheduler_service {
        service.stop().await;
    }
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    Ok(())
}
