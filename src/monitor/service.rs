//! The health monitor loop and its on-demand operations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::{ExecutionLinker, KeywordClassifier, ProcessClassifier, RegexLinker};
use super::cleanup::{self, CleanupPolicy, CleanupReason, CleanupReport, CLEANUP_ERROR_KIND};
use super::process::{ProcessInfo, ProcessTable, SystemProcessTable};
use super::reconcile::{self, ReconcileReport};
use super::snapshot::{HealthSnapshot, ProcessSnapshot};
use super::MonitorError;
use crate::config::MonitorConfig;
use crate::ledger::{ExecutionLedger, LedgerError};

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    ledger: ExecutionLedger,
    table: Arc<dyn ProcessTable>,
    classifier: Arc<dyn ProcessClassifier>,
    linker: Arc<dyn ExecutionLinker>,
    config: MonitorConfig,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
    running: Mutex<Option<Running>>,
}

/// Watches the worker pool and keeps the ledger consistent with it.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(
        ledger: ExecutionLedger,
        table: Arc<dyn ProcessTable>,
        classifier: Arc<dyn ProcessClassifier>,
        linker: Arc<dyn ExecutionLinker>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                table,
                classifier,
                linker,
                config,
                last_cycle_at: Mutex::new(None),
                running: Mutex::new(None),
            }),
        }
    }

    /// Monitor over the real process table with the configured rules.
    pub fn from_config(ledger: ExecutionLedger, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Ok(Self::new(
            ledger,
            Arc::new(SystemProcessTable::new()),
            Arc::new(KeywordClassifier::from_config(config)),
            Arc::new(RegexLinker::from_config(config)?),
            config.clone(),
        ))
    }

    fn policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            max_execution_hours: self.inner.config.max_execution_hours,
            orphan_grace: Duration::minutes(self.inner.config.orphan_grace_minutes as i64),
        }
    }

    /// Enumerate processes on the blocking pool.
    async fn all_processes(&self) -> Result<Vec<ProcessInfo>, MonitorError> {
        let table = Arc::clone(&self.inner.table);
        tokio::task::spawn_blocking(move || table.processes())
            .await
            .map_err(|e| MonitorError::ProcessAccess(format!("process scan aborted: {}", e)))?
    }

    /// Worker processes as raw facts plus their derived snapshots.
    async fn scan(&self, now: DateTime<Utc>) -> Result<(Vec<ProcessInfo>, Vec<ProcessSnapshot>), MonitorError> {
        let all = self.all_processes().await?;
        let live: HashSet<u32> = all.iter().map(|p| p.pid).collect();
        let max_age = Duration::hours(self.inner.config.max_execution_hours as i64);

        let workers: Vec<ProcessInfo> = all
            .into_iter()
            .filter(|p| self.inner.classifier.is_worker(p))
            .collect();
        let snapshots = workers
            .iter()
            .map(|p| ProcessSnapshot::derive(p, self.inner.linker.link(p), &live, max_age, now))
            .collect();
        Ok((workers, snapshots))
    }

    /// Worker snapshots for the current moment.
    pub async fn processes(&self) -> Result<Vec<ProcessSnapshot>, MonitorError> {
        Ok(self.scan(Utc::now()).await?.1)
    }

    /// Terminate orphaned and timed-out workers and cancel their records.
    pub async fn run_cleanup_now(&self) -> Result<CleanupReport, MonitorError> {
        let (_, snapshots) = self.scan(Utc::now()).await?;
        let targets = cleanup::select_targets(&snapshots, &self.policy());
        let mut report = CleanupReport::default();
        if targets.is_empty() {
            debug!(workers = snapshots.len(), "no workers need cleanup");
            return Ok(report);
        }

        for t in &targets {
            warn!(
                pid = t.process.pid,
                age_seconds = t.process.age_seconds,
                execution_id = t.process.linked_execution_id.as_deref().unwrap_or("-"),
                reason = %t.reason.message(),
                "terminating worker"
            );
        }

        let pids = targets.iter().map(|t| t.process.pid).collect();
        let grace = StdDuration::from_secs(self.inner.config.termination_grace_secs);
        let result = cleanup::terminate_all(Arc::clone(&self.inner.table), pids, grace).await?;

        for target in &targets {
            if !result.is_gone(target.process.pid) {
                continue;
            }
            match target.reason {
                CleanupReason::Orphan => report.orphans_cleaned += 1,
                CleanupReason::Timeout { .. } => report.timeouts_handled += 1,
            }
            let Some(execution_id) = &target.process.linked_execution_id else {
                continue;
            };
            match self
                .inner
                .ledger
                .cancel(execution_id, CLEANUP_ERROR_KIND, &target.reason.message())
                .await
            {
                Ok(()) => report.executions_cancelled += 1,
                Err(LedgerError::InvalidTransition { .. }) | Err(LedgerError::NotFound(_)) => {
                    debug!(execution_id = %execution_id, "record already settled");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            orphans = report.orphans_cleaned,
            timeouts = report.timeouts_handled,
            cancelled = report.executions_cancelled,
            "cleanup pass finished"
        );
        Ok(report)
    }

    /// Cancel `Running` records that no live worker references.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, MonitorError> {
        let now = Utc::now();
        let all = self.all_processes().await?;
        if all.is_empty() {
            return Err(MonitorError::ReconciliationAmbiguity {
                execution_id: "*".into(),
                reason: "process table is empty".into(),
            });
        }
        let workers: Vec<ProcessInfo> = all
            .into_iter()
            .filter(|p| self.inner.classifier.is_worker(p))
            .collect();
        let confirmation = Duration::minutes(self.inner.config.reconcile_confirmation_minutes as i64);
        let report = reconcile::reconcile(
            &self.inner.ledger,
            &workers,
            self.inner.linker.as_ref(),
            confirmation,
            now,
        )
        .await?;
        if report.cancelled > 0 {
            info!(checked = report.checked, cancelled = report.cancelled, "reconciliation finished");
        }
        Ok(report)
    }

    /// One full monitor cycle. Errors are logged, never propagated.
    pub async fn run_cycle(&self) {
        if let Err(e) = self.run_cleanup_now().await {
            error!(error = %e, "cleanup pass failed");
        }
        if let Err(e) = self.reconcile_now().await {
            error!(error = %e, "reconciliation pass failed");
        }
        if let Ok(mut last) = self.inner.last_cycle_at.lock() {
            *last = Some(Utc::now());
        }
    }

    pub async fn health_snapshot(&self) -> Result<HealthSnapshot, MonitorError> {
        let now = Utc::now();
        let (_, processes) = self.scan(now).await?;
        let config = &self.inner.config;
        Ok(HealthSnapshot {
            monitoring_active: self.is_active(),
            check_interval_secs: config.check_interval_secs,
            max_execution_hours: config.max_execution_hours,
            orphan_grace_minutes: config.orphan_grace_minutes,
            reconcile_confirmation_minutes: config.reconcile_confirmation_minutes,
            matched_processes: processes.len(),
            orphan_processes: processes.iter().filter(|p| p.is_orphan).count(),
            over_timeout_processes: processes.iter().filter(|p| p.over_timeout).count(),
            total_cpu_percent: processes.iter().map(|p| p.cpu_percent).sum(),
            total_memory_mb: processes.iter().map(|p| p.memory_mb).sum(),
            processes,
            last_cycle_at: self.inner.last_cycle_at.lock().ok().and_then(|g| *g),
            generated_at: now,
        })
    }

    /// Spawn the monitor loop. A second call while active is a no-op.
    pub fn start(&self) {
        let Ok(mut running) = self.inner.running.lock() else {
            return;
        };
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let monitor = self.clone();
        let period = StdDuration::from_secs(self.inner.config.check_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "health monitor started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => monitor.run_cycle().await,
                }
            }
            info!("health monitor stopped");
        });
        *running = Some(Running { token, handle });
    }

    pub async fn stop(&self) {
        let running = match self.inner.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "monitor loop ended abnormally");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .running
            .lock()
            .map(|g| g.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }
}
