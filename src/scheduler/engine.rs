//! Tick loop and dispatch protocol.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::{JobRequest, JobRunner};
use super::store::{PlannedRun, TaskStore};
use super::task::ScheduledTask;
use super::DispatchError;
use crate::ledger::{
    CancellationHandle, ExecutionLedger, ExecutionPatch, ExecutionStatus, LedgerError,
    NewExecution, Subject,
};

/// `triggered_by` value on records created by the scheduler.
pub const TRIGGERED_BY: &str = "scheduler";

/// Error kind recorded when a dispatch fails.
pub const DISPATCH_ERROR_KIND: &str = "dispatch_error";

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub task_id: String,
    /// None when the record could not be created.
    pub execution_id: Option<String>,
    /// Final ledger status. `Failed` when no record exists.
    pub status: ExecutionStatus,
    /// This failure pushed the task over `max_failures`.
    pub task_disabled: bool,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Success | ExecutionStatus::PartialSuccess
        )
    }
}

/// Removes a task id from the in-flight set when dropped, including on panic.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.task_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Evaluates tasks and dispatches the due ones.
#[derive(Clone)]
pub struct Scheduler {
    ledger: ExecutionLedger,
    tasks: TaskStore,
    runner: Arc<dyn JobRunner>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(
        ledger: ExecutionLedger,
        tasks: TaskStore,
        runner: Arc<dyn JobRunner>,
        max_concurrent_dispatches: usize,
    ) -> Self {
        Self {
            ledger,
            tasks,
            runner,
            limiter: Arc::new(Semaphore::new(max_concurrent_dispatches.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub async fn list_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        self.tasks.load().await
    }

    /// Re-enable a task and clear its failure streak.
    pub async fn enable_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.tasks.set_enabled(task_id, true).await
    }

    pub async fn disable_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.tasks.set_enabled(task_id, false).await
    }

    /// Dry run: planned firings over the next `hours`.
    pub async fn preview_next_runs(&self, hours: u64) -> anyhow::Result<Vec<PlannedRun>> {
        self.tasks.preview_next_runs(Utc::now(), hours).await
    }

    /// Ids of tasks with a dispatch currently running.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.in_flight.lock() {
            Ok(set) => set.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Evaluate every task at `now` and start a dispatch for each due one.
    ///
    /// Returns the handles of the dispatches started; each runs on its own
    /// tokio task and resolves once its record and task state are settled.
    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<DispatchOutcome>>, DispatchError> {
        let tasks = self
            .tasks
            .load()
            .await
            .map_err(|e| DispatchError::TaskStore(format!("{:#}", e)))?;

        let mut handles = Vec::new();
        for task in tasks {
            if !task.is_due(now) {
                continue;
            }
            let Some(guard) = self.claim(&task.task_id) else {
                debug!(task = %task.task_id, "task still in flight, skipping");
                continue;
            };

            info!(task = %task.task_id, frequency = %task.frequency, "task due, dispatching");
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                scheduler.dispatch(task, now).await
            }));
        }
        Ok(handles)
    }

    fn claim(&self, task_id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(task_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            task_id: task_id.to_string(),
        })
    }

    async fn dispatch(&self, task: ScheduledTask, now: DateTime<Utc>) -> DispatchOutcome {
        let new = NewExecution::new(
            task.task_type.execution_type(),
            Subject::from(task.subjects.clone()),
            TRIGGERED_BY,
        )
        .with_metadata(task_metadata(&task));

        let (execution_id, status) = match self.ledger.create(new).await {
            Ok(execution_id) => {
                let result = self.execute(&task, &execution_id).await;
                let status = self.finish(&task, &execution_id, result).await;
                (Some(execution_id), status)
            }
            Err(e) => {
                error!(task = %task.task_id, error = %e, "failed to create execution record");
                (None, ExecutionStatus::Failed)
            }
        };

        let mut outcome = DispatchOutcome {
            task_id: task.task_id.clone(),
            execution_id,
            status,
            task_disabled: false,
        };

        if outcome.succeeded() {
            if let Err(e) = self.tasks.record_success(&task.task_id, now).await {
                error!(task = %task.task_id, error = %e, "failed to record task success");
            }
        } else {
            match self.tasks.record_failure(&task.task_id, now).await {
                Ok(disabled) => {
                    outcome.task_disabled = disabled;
                    if disabled {
                        warn!(
                            task = %task.task_id,
                            max_failures = task.max_failures,
                            "task disabled after repeated failures"
                        );
                    }
                }
                Err(e) => error!(task = %task.task_id, error = %e, "failed to record task failure"),
            }
        }

        info!(
            task = %task.task_id,
            execution_id = outcome.execution_id.as_deref().unwrap_or("-"),
            status = %outcome.status,
            "dispatch finished"
        );
        outcome
    }

    /// Running transition, limiter permit, runner call.
    async fn execute(&self, task: &ScheduledTask, execution_id: &str) -> Result<(), DispatchError> {
        self.ledger
            .transition(
                execution_id,
                ExecutionStatus::Running,
                ExecutionPatch::operation("waiting for dispatch slot"),
            )
            .await?;

        let _permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::LimiterClosed)?;

        self.ledger
            .update(execution_id, ExecutionPatch::operation("running"))
            .await?;

        let request = JobRequest::for_task(task, execution_id);
        let cancel = CancellationHandle::new(self.ledger.clone(), execution_id);
        self.runner
            .run(request, cancel)
            .await
            .map_err(|e| DispatchError::Runner(format!("{:#}", e)))
    }

    /// Record the final status. When the record already reached a terminal
    /// status on its own, that status stands.
    async fn finish(
        &self,
        task: &ScheduledTask,
        execution_id: &str,
        result: Result<(), DispatchError>,
    ) -> ExecutionStatus {
        let target = match &result {
            Ok(()) => ExecutionStatus::Success,
            Err(e) => {
                warn!(task = %task.task_id, execution_id = %execution_id, error = %e, "dispatch failed");
                if let Err(le) = self
                    .ledger
                    .append_error(execution_id, DISPATCH_ERROR_KIND, &e.to_string())
                    .await
                {
                    error!(execution_id = %execution_id, error = %le, "failed to record dispatch error");
                }
                ExecutionStatus::Failed
            }
        };

        match self
            .ledger
            .transition(execution_id, target, ExecutionPatch::default())
            .await
        {
            Ok(()) => target,
            Err(LedgerError::InvalidTransition { from, .. }) if from.is_terminal() => {
                debug!(execution_id = %execution_id, status = %from, "record already terminal");
                from
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "failed to record final status");
                match self.ledger.status(execution_id).await {
                    Ok(status) if status.is_terminal() => status,
                    _ => ExecutionStatus::Failed,
                }
            }
        }
    }
}

fn task_metadata(task: &ScheduledTask) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("task_id".into(), json!(task.task_id));
    metadata.insert("frequency".into(), json!(task.frequency.as_str()));
    metadata.insert("target_timeframes".into(), json!(task.target_timeframes));
    metadata.insert("target_strategies".into(), json!(task.target_strategies));
    metadata
}

// ---------------------------------------------------------------------------
// SchedulerService
// ---------------------------------------------------------------------------

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background tick loop around a [`Scheduler`].
pub struct SchedulerService {
    scheduler: Scheduler,
    tick_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl SchedulerService {
    pub fn new(scheduler: Scheduler, tick_interval: Duration) -> Self {
        Self {
            scheduler,
            tick_interval,
            running: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Spawn the tick loop. A second call while running is a no-op.
    pub fn start(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let scheduler = self.scheduler.clone();
        let tick_interval = self.tick_interval;
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            info!(tick_secs = tick_interval.as_secs(), "scheduler started");
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.run_tick(Utc::now()).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });

        *running = Some(Running { token, handle });
    }

    /// Stop the tick loop. Dispatches already started keep running.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Frequency, TaskDefinition, TaskType};
    use crate::storage::open_pool;
    use async_trait::async_trait;

    struct OkRunner;

    #[async_trait]
    impl JobRunner for OkRunner {
        async fn run(&self, _request: JobRequest, _cancel: CancellationHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn scheduler(runner: Arc<dyn JobRunner>) -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("s.db")).unwrap();
        let defs = vec![TaskDefinition {
            task_id: "hourly".into(),
            task_type: TaskType::Training,
            subjects: vec!["BTC".into(), "ETH".into()],
            frequency: Frequency::Hourly,
            target_timeframes: vec!["1h".into()],
            target_strategies: vec!["ml".into()],
            enabled: true,
            max_failures: None,
        }];
        let ledger = ExecutionLedger::new(pool.clone());
        let tasks = TaskStore::new(pool, defs, 3);
        (dir, Scheduler::new(ledger, tasks, runner, 2))
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_success() {
        let (_dir, s) = scheduler(Arc::new(OkRunner));
        let now = Utc::now();
        let handles = s.run_tick(now).await.unwrap();
        assert_eq!(handles.len(), 1);
        let outcome = handles.into_iter().next().unwrap().await.unwrap();
        assert!(outcome.succeeded());

        let id = outcome.execution_id.unwrap();
        let rec = s.ledger().get(&id).await.unwrap();
        assert_eq!(rec.status, ExecutionStatus::Success);
        assert_eq!(rec.triggered_by, TRIGGERED_BY);
        assert_eq!(rec.metadata.get("task_id"), Some(&json!("hourly")));
        assert_eq!(rec.execution_type, TaskType::Training.execution_type());

        assert!(s.run_tick(now).await.unwrap().is_empty(), "same period fired twice");
        assert!(s.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_task_not_redispatched() {
        struct SlowRunner;

        #[async_trait]
        impl JobRunner for SlowRunner {
            async fn run(&self, _r: JobRequest, _c: CancellationHandle) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }
        }

        let (_dir, s) = scheduler(Arc::new(SlowRunner));
        let first = s.run_tick(Utc::now()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(s.run_tick(Utc::now()).await.unwrap().is_empty());
        for h in first {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_worker_reported_status_stands() {
        struct PartialRunner {
            ledger: ExecutionLedger,
        }

        #[async_trait]
        impl JobRunner for PartialRunner {
            async fn run(&self, r: JobRequest, _c: CancellationHandle) -> anyhow::Result<()> {
                self.ledger
                    .transition(&r.execution_id, ExecutionStatus::PartialSuccess, ExecutionPatch::default())
                    .await?;
                Ok(())
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("p.db")).unwrap();
        let ledger = ExecutionLedger::new(pool.clone());
        let defs = vec![TaskDefinition {
            task_id: "daily".into(),
            task_type: TaskType::Backtest,
            subjects: vec!["SOL".into()],
            frequency: Frequency::Daily,
            target_timeframes: vec![],
            target_strategies: vec![],
            enabled: true,
            max_failures: Some(1),
        }];
        let s = Scheduler::new(
            ledger.clone(),
            TaskStore::new(pool, defs, 3),
            Arc::new(PartialRunner { ledger }),
            1,
        );
        let outcome = s.run_tick(Utc::now()).await.unwrap().remove(0).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::PartialSuccess);
        assert!(outcome.succeeded());
        assert!(!outcome.task_disabled);
    }

    #[tokio::test]
    async fn test_service_start_stop() {
        let (_dir, s) = scheduler(Arc::new(OkRunner));
        let service = SchedulerService::new(s, Duration::from_secs(3600));
        assert!(!service.is_running());
        service.start();
        assert!(service.is_running());
        service.stop().await;
        assert!(!service.is_running());
    }
}
