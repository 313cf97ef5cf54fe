//! Scheduler dispatch behaviour with in-process fake runners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jobwarden::ledger::{CancellationHandle, ExecutionLedger, ExecutionStatus};
use jobwarden::scheduler::{
    Frequency, JobRequest, JobRunner, Scheduler, TaskDefinition, TaskStore, TaskType,
};
use jobwarden::storage::open_pool;
use tempfile::TempDir;

fn definition(task_id: &str, frequency: Frequency, max_failures: Option<u32>) -> TaskDefinition {
    TaskDefinition {
        task_id: task_id.to_string(),
        task_type: TaskType::Backtest,
        subjects: vec!["BTC".into()],
        frequency,
        target_timeframes: vec!["1h".into()],
        target_strategies: vec!["breakout".into()],
        enabled: true,
        max_failures,
    }
}

fn scheduler(
    defs: Vec<TaskDefinition>,
    runner: Arc<dyn JobRunner>,
    limit: usize,
) -> (TempDir, Scheduler) {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("sched.db")).unwrap();
    let ledger = ExecutionLedger::new(pool.clone());
    let tasks = TaskStore::new(pool, defs, 3);
    (dir, Scheduler::new(ledger, tasks, runner, limit))
}

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, day, hour, minute, 0).unwrap()
}

struct FailingRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl JobRunner for FailingRunner {
    async fn run(&self, _request: JobRequest, _cancel: CancellationHandle) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("worker crashed")
    }
}

#[tokio::test]
async fn test_daily_task_disabled_after_max_failures() {
    let runner = Arc::new(FailingRunner {
        calls: AtomicUsize::new(0),
    });
    let (_dir, s) = scheduler(
        vec![definition("daily", Frequency::Daily, Some(3))],
        runner.clone(),
        2,
    );

    let mut disabled_on = None;
    for day in 10..13u32 {
        let handles = s.run_tick(at(day, 1, 0)).await.unwrap();
        assert_eq!(handles.len(), 1, "day {}", day);
        for h in handles {
            let outcome = h.await.unwrap();
            assert_eq!(outcome.status, ExecutionStatus::Failed);
            if outcome.task_disabled {
                disabled_on = Some(day);
            }

            let rec = s.ledger().get(outcome.execution_id.as_deref().unwrap()).await.unwrap();
            assert_eq!(rec.status, ExecutionStatus::Failed);
            assert_eq!(rec.errors.len(), 1);
            assert_eq!(rec.errors[0].kind, "dispatch_error");
            assert!(rec.errors[0].message.contains("worker crashed"));
        }

        // The failed run used up the day.
        for minute in 1..5 {
            assert!(
                s.run_tick(at(day, 1, minute)).await.unwrap().is_empty(),
                "refired on day {} at 01:{:02}",
                day,
                minute
            );
        }
    }

    assert_eq!(disabled_on, Some(12));
    assert!(s.run_tick(at(13, 1, 0)).await.unwrap().is_empty());
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    let task = s.tasks().load().await.unwrap().remove(0);
    assert!(!task.enabled);
    assert_eq!(task.consecutive_failures, 3);
    assert!(task.last_executed_at.is_none());
}

struct CountingRunner {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

#[async_trait]
impl JobRunner for CountingRunner {
    async fn run(&self, _request: JobRequest, _cancel: CancellationHandle) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limiter_caps_in_flight_runs() {
    let runner = Arc::new(CountingRunner {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        total: AtomicUsize::new(0),
    });
    let defs = (0..6)
        .map(|i| definition(&format!("task-{}", i), Frequency::Hourly, None))
        .collect();
    let (_dir, s) = scheduler(defs, runner.clone(), 2);

    let handles = s.run_tick(at(10, 9, 0)).await.unwrap();
    assert_eq!(handles.len(), 6);
    for h in handles {
        assert!(h.await.unwrap().succeeded());
    }

    assert_eq!(runner.total.load(Ordering::SeqCst), 6);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    assert!(runner.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_every_4_hours_fires_once_per_period() {
    let runner = Arc::new(CountingRunner {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        total: AtomicUsize::new(0),
    });
    let (_dir, s) = scheduler(
        vec![definition("four-hourly", Frequency::Every4Hours, None)],
        runner.clone(),
        1,
    );

    for (hour, minute, expect) in [(8, 5, 1), (9, 0, 0), (11, 59, 0), (12, 0, 1)] {
        let handles = s.run_tick(at(10, hour, minute)).await.unwrap();
        assert_eq!(handles.len(), expect, "tick at {:02}:{:02}", hour, minute);
        for h in handles {
            h.await.unwrap();
        }
    }
    assert_eq!(runner.total.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_one_failing_task_does_not_block_others() {
    struct Selective;

    #[async_trait]
    impl JobRunner for Selective {
        async fn run(&self, request: JobRequest, _c: CancellationHandle) -> anyhow::Result<()> {
            if request.task_id == "bad" {
                anyhow::bail!("bad task");
            }
            Ok(())
        }
    }

    let (_dir, s) = scheduler(
        vec![
            definition("bad", Frequency::Daily, None),
            definition("good", Frequency::Daily, None),
        ],
        Arc::new(Selective),
        2,
    );
    let mut outcomes = Vec::new();
    for h in s.run_tick(at(11, 0, 0)).await.unwrap() {
        outcomes.push(h.await.unwrap());
    }
    outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    assert_eq!(outcomes[0].status, ExecutionStatus::Failed);
    assert_eq!(outcomes[1].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_disabled_task_resumes_after_enable() {
    let runner = Arc::new(FailingRunner {
        calls: AtomicUsize::new(0),
    });
    let (_dir, s) = scheduler(
        vec![definition("weekly", Frequency::Weekly, Some(1))],
        runner.clone(),
        1,
    );
    let outcome = s.run_tick(at(12, 0, 0)).await.unwrap().remove(0).await.unwrap();
    assert!(outcome.task_disabled);
    assert!(s.run_tick(at(12, 0, 1)).await.unwrap().is_empty());

    s.enable_task("weekly").await.unwrap();
    let handles = s.run_tick(at(12, 0, 2)).await.unwrap();
    assert_eq!(handles.len(), 1);
    for h in handles {
        h.await.unwrap();
    }
}
