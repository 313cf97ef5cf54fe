//! Persistent task registry backed by the `scheduled_tasks` table.
//!
//! Definitions come from configuration; runtime state (enabled flag, last
//! run, last attempt, failure streak) lives in SQLite so it survives restarts and so the
//! CLI can enable or disable a task while `serve` is running.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use super::task::{ScheduledTask, TaskDefinition, TaskType};
use crate::storage::{format_ts, parse_ts, Pool};

/// One entry of a dry-run preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub task_id: String,
    pub task_type: TaskType,
}

/// Registry of scheduled tasks.
#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
    definitions: Vec<TaskDefinition>,
    default_max_failures: u32,
}

impl TaskStore {
    pub fn new(pool: Pool, definitions: Vec<TaskDefinition>, default_max_failures: u32) -> Self {
        Self {
            pool,
            definitions,
            default_max_failures,
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("failed to get database connection")?;
            f(&mut conn)
        })
        .await
        .context("task store worker panicked")?
    }

    fn definition(&self, task_id: &str) -> Result<&TaskDefinition> {
        self.definitions
            .iter()
            .find(|d| d.task_id == task_id)
            .ok_or_else(|| anyhow::anyhow!("task '{}' is not defined in configuration", task_id))
    }

    /// Current view of every configured task, merged with persisted state.
    ///
    /// Rows are created on first sight. A definition disabled in
    /// configuration stays disabled whatever the stored flag says.
    pub async fn load(&self) -> Result<Vec<ScheduledTask>> {
        let definitions = self.definitions.clone();
        let default_max_failures = self.default_max_failures;
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = format_ts(Utc::now());
            let mut tasks = Vec::with_capacity(definitions.len());
            for def in &definitions {
                tx.execute(
                    "INSERT OR IGNORE INTO scheduled_tasks (task_id, enabled, updated_at)
                     VALUES (?1, ?2, ?3)",
                    params![def.task_id, def.enabled, now],
                )?;
                let mut task = ScheduledTask::from_definition(def, default_max_failures);
                read_state(&tx, &mut task)?;
                task.enabled &= def.enabled;
                tasks.push(task);
            }
            tx.commit()?;
            Ok(tasks)
        })
        .await
    }

    /// A successful dispatch consumed the period containing `at`.
    pub async fn record_success(&self, task_id: &str, at: DateTime<Utc>) -> Result<()> {
        let task_id = task_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET last_executed_at = ?1, last_attempted_at = ?1,
                     consecutive_failures = 0, updated_at = ?2
                 WHERE task_id = ?3",
                params![format_ts(at), format_ts(Utc::now()), task_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Count a failed dispatch fired at `at`; the period is used up all the
    /// same. Returns true when this failure disabled the task.
    pub async fn record_failure(&self, task_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let def = self.definition(task_id)?.clone();
        let default_max_failures = self.default_max_failures;
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut task = ScheduledTask::from_definition(&def, default_max_failures);
            read_state(&tx, &mut task)?;
            let disabled = task.record_failure(at);
            tx.execute(
                "UPDATE scheduled_tasks
                 SET consecutive_failures = ?1, enabled = ?2, last_attempted_at = ?3,
                     updated_at = ?4
                 WHERE task_id = ?5",
                params![
                    task.consecutive_failures,
                    task.enabled,
                    format_ts(at),
                    format_ts(Utc::now()),
                    task.task_id
                ],
            )?;
            tx.commit()?;
            Ok(disabled)
        })
        .await
    }

    /// Flip the stored enabled flag. Enabling also clears the failure streak
    /// and the last failed attempt, so the task is retried on the next tick.
    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<()> {
        self.definition(task_id)?;
        let task_id = task_id.to_string();
        self.blocking(move |conn| {
            let now = format_ts(Utc::now());
            conn.execute(
                "INSERT OR IGNORE INTO scheduled_tasks (task_id, enabled, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![task_id, enabled, now],
            )?;
            conn.execute(
                "UPDATE scheduled_tasks
                 SET enabled = ?1,
                     consecutive_failures = CASE WHEN ?1 THEN 0 ELSE consecutive_failures END,
                     last_attempted_at = CASE WHEN ?1 THEN last_executed_at ELSE last_attempted_at END,
                     updated_at = ?2
                 WHERE task_id = ?3",
                params![enabled, now, task_id],
            )?;
            info!(task = %task_id, enabled, "task enabled flag changed");
            Ok(())
        })
        .await
    }

    /// Every planned firing of an enabled task within `hours` of `now`,
    /// earliest first. Nothing is dispatched.
    pub async fn preview_next_runs(&self, now: DateTime<Utc>, hours: u64) -> Result<Vec<PlannedRun>> {
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for task in self.load().await? {
            if !task.enabled {
                continue;
            }
            let schedule = CronSchedule::from_str(task.frequency.cron_expr())
                .map_err(|e| anyhow::anyhow!("invalid cron expression for {}: {}", task.frequency, e))?;
            for next in schedule.after(&now) {
                if next > end {
                    break;
                }
                preview.push(PlannedRun {
                    at: next,
                    task_id: task.task_id.clone(),
                    task_type: task.task_type,
                });
            }
        }

        preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.task_id.cmp(&b.task_id)));
        debug!(hours, planned = preview.len(), "computed schedule preview");
        Ok(preview)
    }
}

fn read_state(conn: &Connection, task: &mut ScheduledTask) -> Result<()> {
    let row = conn
        .query_row(
            "SELECT enabled, last_executed_at, last_attempted_at, consecutive_failures
             FROM scheduled_tasks WHERE task_id = ?1",
            [&task.task_id],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            },
        )
        .optional()?;
    if let Some((enabled, last, attempted, failures)) = row {
        task.enabled = enabled;
        task.last_executed_at = last.as_deref().and_then(parse_ts);
        task.last_attempted_at = attempted.as_deref().and_then(parse_ts);
        task.consecutive_failures = failures;
    }
    Ok(())
}
