use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::id;
use super::model::{
    ErrorEntry, ExecutionPatch, ExecutionRecord, ExecutionStatistics, ExecutionStatus,
    ExecutionSummary, ExecutionType, ListFilter, NewExecution, NewStep, PruneReport,
    ResourceStats, Step, StepStatus, TypeStatistics,
};
use super::LedgerError;
use crate::storage::{format_ts, parse_ts, Pool};

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

/// Handle to the execution ledger. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ExecutionLedger {
    pool: Pool,
}

/// Columns of a record read inside a transaction before mutating it.
struct RecordState {
    status: ExecutionStatus,
    progress: f64,
    total_steps: u32,
    started_at: DateTime<Utc>,
}

impl ExecutionLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run `f` against a pooled connection on the blocking thread pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    /// Create a `Pending` record with a freshly generated id.
    pub async fn create(&self, new: NewExecution) -> Result<String, LedgerError> {
        let execution_id = id::generate(new.execution_type, Utc::now());
        self.create_with_id(&execution_id, new).await?;
        Ok(execution_id)
    }

    /// Create a `Pending` record under a caller-chosen id.
    ///
    /// Lets a launcher persist the record before the worker process that
    /// looks it up is started.
    pub async fn create_with_id(
        &self,
        execution_id: &str,
        new: NewExecution,
    ) -> Result<(), LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let now = format_ts(Utc::now());
            let subject_json = serde_json::to_string(&new.subject)?;
            let metadata_json = serde_json::to_string(&new.metadata)?;

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO executions (
                    execution_id, execution_type, subject_json, status, triggered_by,
                    total_steps, metadata_json, started_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    execution_id,
                    new.execution_type.as_str(),
                    subject_json,
                    ExecutionStatus::Pending.as_str(),
                    new.triggered_by,
                    new.total_steps,
                    metadata_json,
                    now,
                ],
            )?;
            for (position, subject) in new.subject.items().into_iter().enumerate() {
                tx.execute(
                    "INSERT INTO execution_subjects (execution_id, position, subject)
                     VALUES (?1, ?2, ?3)",
                    params![execution_id, position as i64, subject],
                )?;
            }
            tx.commit()?;

            info!(
                execution_id = %execution_id,
                execution_type = %new.execution_type,
                subject = %new.subject,
                triggered_by = %new.triggered_by,
                "execution created"
            );
            Ok(())
        })
        .await
    }

    /// Move a record to `status`, applying `patch` in the same transaction.
    ///
    /// Entering a terminal status stamps `ended_at` and `duration_seconds`.
    pub async fn transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<(), LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &execution_id)?;
            if !state.status.can_transition_to(status) {
                return Err(LedgerError::InvalidTransition {
                    execution_id,
                    from: state.status,
                    to: status,
                });
            }

            let now = Utc::now();
            apply_patch(&tx, &execution_id, &state, &patch, now)?;
            set_status(&tx, &execution_id, &state, status, now)?;
            tx.commit()?;

            debug!(execution_id = %execution_id, from = %state.status, to = %status, "execution transitioned");
            Ok(())
        })
        .await
    }

    /// Apply a patch without changing status. Rejected once terminal.
    pub async fn update(
        &self,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> Result<(), LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &execution_id)?;
            reject_if_terminal(&execution_id, &state)?;
            apply_patch(&tx, &execution_id, &state, &patch, Utc::now())?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Append a step and recompute progress. Returns the new progress value.
    ///
    /// Progress counts distinct step names that reached `Success`, so
    /// reporting the same step complete twice does not move it further.
    pub async fn append_step(
        &self,
        execution_id: &str,
        step: NewStep,
    ) -> Result<f64, LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &execution_id)?;
            reject_if_terminal(&execution_id, &state)?;

            let now = Utc::now();
            let (started_at, ended_at) = match step.status {
                StepStatus::Pending => (None, None),
                StepStatus::Running => (Some(now), None),
                _ => {
                    let started = step
                        .duration_seconds
                        .map(|secs| now - Duration::milliseconds((secs * 1000.0) as i64));
                    (started, Some(now))
                }
            };
            let result_json = step
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            tx.execute(
                "INSERT INTO execution_steps (
                    execution_id, name, status, started_at, ended_at, duration_seconds,
                    result_json, error_message, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    execution_id,
                    step.name,
                    step.status.as_str(),
                    started_at.map(format_ts),
                    ended_at.map(format_ts),
                    step.duration_seconds,
                    result_json,
                    step.error_message,
                    format_ts(now),
                ],
            )?;

            if step.status == StepStatus::Running {
                tx.execute(
                    "UPDATE executions SET current_operation = ?1, updated_at = ?2
                     WHERE execution_id = ?3",
                    params![step.name, format_ts(now), execution_id],
                )?;
            }

            let progress = recompute_progress(&tx, &execution_id, state.total_steps, state.progress)?;
            tx.commit()?;

            debug!(
                execution_id = %execution_id,
                step = %step.name,
                status = step.status.as_str(),
                progress,
                "step appended"
            );
            Ok(progress)
        })
        .await
    }

    /// Append an error entry. Allowed in every status.
    pub async fn append_error(
        &self,
        execution_id: &str,
        kind: &str,
        message: &str,
    ) -> Result<ErrorEntry, LedgerError> {
        let execution_id = execution_id.to_string();
        let kind = kind.to_string();
        let message = message.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            load_state(&tx, &execution_id)?;
            let entry = insert_error(&tx, &execution_id, &kind, &message, Utc::now())?;
            tx.commit()?;
            debug!(execution_id = %execution_id, kind = %entry.kind, "error appended");
            Ok(entry)
        })
        .await
    }

    /// Record `reason` and force the record to `Cancelled` in one transaction.
    ///
    /// Unlike [`transition`](Self::transition) this also accepts a `Pending`
    /// record, so a dispatch that never reached `Running` can be reset.
    pub async fn cancel(
        &self,
        execution_id: &str,
        kind: &str,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let execution_id = execution_id.to_string();
        let kind = kind.to_string();
        let reason = reason.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let state = load_state(&tx, &execution_id)?;
            if state.status.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    execution_id,
                    from: state.status,
                    to: ExecutionStatus::Cancelled,
                });
            }
            let now = Utc::now();
            insert_error(&tx, &execution_id, &kind, &reason, now)?;
            set_status(&tx, &execution_id, &state, ExecutionStatus::Cancelled, now)?;
            tx.commit()?;

            info!(execution_id = %execution_id, kind = %kind, reason = %reason, "execution cancelled");
            Ok(())
        })
        .await
    }

    /// Current status only. Used by workers polling for cancellation.
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionStatus, LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT status FROM executions WHERE execution_id = ?1",
                    [&execution_id],
                    |row| row.get(0),
                )
                .optional()?;
            let raw = raw.ok_or_else(|| LedgerError::NotFound(execution_id.clone()))?;
            ExecutionStatus::from_str(&raw).map_err(LedgerError::Storage)
        })
        .await
    }

    /// Full record including steps and errors, read from one snapshot.
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord, LedgerError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let record = tx
                .query_row(
                    "SELECT execution_id, execution_type, subject_json, status, triggered_by,
                            current_operation, progress_percentage, total_steps, metadata_json,
                            peak_cpu_percent, peak_memory_mb, started_at, ended_at, duration_seconds
                     FROM executions WHERE execution_id = ?1",
                    [&execution_id],
                    |row| {
                        let subject_json: String = row.get(2)?;
                        let metadata_json: String = row.get(8)?;
                        Ok(ExecutionRecord {
                            execution_id: row.get(0)?,
                            execution_type: parse_col(1, &row.get::<_, String>(1)?)?,
                            subject: json_col(2, &subject_json)?,
                            status: parse_col(3, &row.get::<_, String>(3)?)?,
                            triggered_by: row.get(4)?,
                            current_operation: row.get(5)?,
                            progress_percentage: row.get(6)?,
                            total_steps: row.get(7)?,
                            metadata: json_col(8, &metadata_json)?,
                            resource_stats: ResourceStats {
                                peak_cpu_percent: row.get(9)?,
                                peak_memory_mb: row.get(10)?,
                            },
                            started_at: ts_col(11, &row.get::<_, String>(11)?)?,
                            ended_at: opt_ts_col(12, row.get(12)?)?,
                            duration_seconds: row.get(13)?,
                            steps: Vec::new(),
                            errors: Vec::new(),
                        })
                    },
                )
                .optional()?;
            let mut record = record.ok_or_else(|| LedgerError::NotFound(execution_id.clone()))?;

            let mut stmt = tx.prepare(
                "SELECT name, status, started_at, ended_at, duration_seconds, result_json, error_message
                 FROM execution_steps WHERE execution_id = ?1 ORDER BY id ASC",
            )?;
            let steps = stmt.query_map([&execution_id], |row| {
                let result_json: Option<String> = row.get(5)?;
                Ok(Step {
                    name: row.get(0)?,
                    status: parse_col(1, &row.get::<_, String>(1)?)?,
                    started_at: opt_ts_col(2, row.get(2)?)?,
                    ended_at: opt_ts_col(3, row.get(3)?)?,
                    duration_seconds: row.get(4)?,
                    result: result_json.as_deref().map(|raw| json_col(5, raw)).transpose()?,
                    error_message: row.get(6)?,
                })
            })?;
            record.steps = steps.collect::<Result<_, _>>()?;
            drop(stmt);

            let mut stmt = tx.prepare(
                "SELECT kind, message, recorded_at FROM execution_errors
                 WHERE execution_id = ?1 ORDER BY id ASC",
            )?;
            let errors = stmt.query_map([&execution_id], |row| {
                Ok(ErrorEntry {
                    kind: row.get(0)?,
                    message: row.get(1)?,
                    timestamp: ts_col(2, &row.get::<_, String>(2)?)?,
                })
            })?;
            record.errors = errors.collect::<Result<_, _>>()?;
            drop(stmt);
            tx.commit()?;

            Ok(record)
        })
        .await
    }

    /// Summaries matching `filter`, newest `started_at` first.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<ExecutionSummary>, LedgerError> {
        self.blocking(move |conn| {
            let since = filter
                .since_days
                .map(|days| format_ts(Utc::now() - Duration::days(days as i64)));
            let mut stmt = conn.prepare(
                "SELECT e.execution_id, e.execution_type, e.subject_json, e.status, e.triggered_by,
                        e.current_operation, e.progress_percentage, e.started_at, e.ended_at,
                        e.duration_seconds,
                        (SELECT COUNT(*) FROM execution_errors x WHERE x.execution_id = e.execution_id)
                 FROM executions e
                 WHERE (?1 IS NULL OR e.execution_type = ?1)
                   AND (?2 IS NULL OR e.status = ?2)
                   AND (?3 IS NULL OR e.started_at >= ?3)
                   AND (?4 IS NULL OR EXISTS (
                        SELECT 1 FROM execution_subjects s
                        WHERE s.execution_id = e.execution_id AND s.subject = ?4))
                 ORDER BY e.started_at DESC, e.execution_id DESC
                 LIMIT ?5 OFFSET ?6",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.execution_type.map(|t| t.as_str()),
                    filter.status.map(|s| s.as_str()),
                    since,
                    filter.subject,
                    filter.limit as i64,
                    filter.offset as i64,
                ],
                |row| {
                    let subject_json: String = row.get(2)?;
                    Ok(ExecutionSummary {
                        execution_id: row.get(0)?,
                        execution_type: parse_col(1, &row.get::<_, String>(1)?)?,
                        subject: json_col(2, &subject_json)?,
                        status: parse_col(3, &row.get::<_, String>(3)?)?,
                        triggered_by: row.get(4)?,
                        current_operation: row.get(5)?,
                        progress_percentage: row.get(6)?,
                        started_at: ts_col(7, &row.get::<_, String>(7)?)?,
                        ended_at: opt_ts_col(8, row.get(8)?)?,
                        duration_seconds: row.get(9)?,
                        error_count: row.get(10)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Every record currently `Running`, newest first.
    pub async fn running(&self) -> Result<Vec<ExecutionSummary>, LedgerError> {
        self.list(ListFilter::with_status(ExecutionStatus::Running))
            .await
    }

    /// Totals over records started within the last `window_days`.
    pub async fn aggregate_statistics(
        &self,
        window_days: u32,
    ) -> Result<ExecutionStatistics, LedgerError> {
        self.blocking(move |conn| {
            let since = format_ts(Utc::now() - Duration::days(window_days as i64));
            let mut stmt = conn.prepare(
                "SELECT execution_type, status, duration_seconds FROM executions
                 WHERE started_at >= ?1",
            )?;
            let rows = stmt.query_map([&since], |row| {
                Ok((
                    parse_col::<ExecutionType>(0, &row.get::<_, String>(0)?)?,
                    parse_col::<ExecutionStatus>(1, &row.get::<_, String>(1)?)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })?;

            let mut stats = ExecutionStatistics {
                window_days,
                ..ExecutionStatistics::default()
            };
            let mut success = 0u64;
            let mut total_duration = 0.0;
            let mut timed = 0u64;
            let mut per_type_timing: BTreeMap<String, (f64, u64)> = BTreeMap::new();

            for r in rows {
                let (execution_type, status, duration) = r?;
                let entry = stats
                    .by_type
                    .entry(execution_type.as_str().to_string())
                    .or_insert_with(TypeStatistics::default);
                entry.total += 1;
                stats.total += 1;
                match status {
                    ExecutionStatus::Success => {
                        entry.success += 1;
                        success += 1;
                    }
                    ExecutionStatus::Failed => {
                        entry.failed += 1;
                        stats.failed_count += 1;
                    }
                    _ => {}
                }
                if let Some(d) = duration {
                    total_duration += d;
                    timed += 1;
                    let t = per_type_timing
                        .entry(execution_type.as_str().to_string())
                        .or_insert((0.0, 0));
                    t.0 += d;
                    t.1 += 1;
                }
            }

            for (name, (sum, count)) in per_type_timing {
                if let Some(entry) = stats.by_type.get_mut(&name) {
                    entry.avg_duration_seconds = sum / count as f64;
                }
            }
            if stats.total > 0 {
                stats.success_rate = success as f64 / stats.total as f64 * 100.0;
            }
            if timed > 0 {
                stats.avg_duration_seconds = total_duration / timed as f64;
            }
            stats.total_compute_hours = total_duration / 3600.0;
            Ok(stats)
        })
        .await
    }

    /// Delete records started more than `older_than_days` ago, with their
    /// child rows.
    pub async fn prune(&self, older_than_days: u32) -> Result<PruneReport, LedgerError> {
        self.blocking(move |conn| {
            let cutoff = format_ts(Utc::now() - Duration::days(older_than_days as i64));
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let doomed = "SELECT execution_id FROM executions WHERE started_at < ?1";

            let steps = tx.execute(
                &format!("DELETE FROM execution_steps WHERE execution_id IN ({})", doomed),
                [&cutoff],
            )?;
            let errors = tx.execute(
                &format!("DELETE FROM execution_errors WHERE execution_id IN ({})", doomed),
                [&cutoff],
            )?;
            tx.execute(
                &format!("DELETE FROM execution_subjects WHERE execution_id IN ({})", doomed),
                [&cutoff],
            )?;
            let executions = tx.execute("DELETE FROM executions WHERE started_at < ?1", [&cutoff])?;
            tx.commit()?;

            let report = PruneReport {
                executions: executions as u64,
                steps: steps as u64,
                errors: errors as u64,
            };
            info!(
                older_than_days,
                executions = report.executions,
                steps = report.steps,
                errors = report.errors,
                "pruned old executions"
            );
            Ok(report)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

fn load_state(tx: &Transaction<'_>, execution_id: &str) -> Result<RecordState, LedgerError> {
    let row = tx
        .query_row(
            "SELECT status, progress_percentage, total_steps, started_at
             FROM executions WHERE execution_id = ?1",
            [execution_id],
            |row| {
                Ok(RecordState {
                    status: parse_col(0, &row.get::<_, String>(0)?)?,
                    progress: row.get(1)?,
                    total_steps: row.get(2)?,
                    started_at: ts_col(3, &row.get::<_, String>(3)?)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| LedgerError::NotFound(execution_id.to_string()))
}

fn reject_if_terminal(execution_id: &str, state: &RecordState) -> Result<(), LedgerError> {
    if state.status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            execution_id: execution_id.to_string(),
            from: state.status,
            to: state.status,
        });
    }
    Ok(())
}

fn apply_patch(
    tx: &Transaction<'_>,
    execution_id: &str,
    state: &RecordState,
    patch: &ExecutionPatch,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if patch.is_empty() {
        return Ok(());
    }
    let stats = patch.resource_stats.unwrap_or_default();
    tx.execute(
        "UPDATE executions SET
            current_operation = COALESCE(?1, current_operation),
            progress_percentage = MAX(progress_percentage, COALESCE(?2, progress_percentage)),
            total_steps = COALESCE(?3, total_steps),
            peak_cpu_percent = CASE WHEN ?4 IS NULL THEN peak_cpu_percent
                                    ELSE MAX(COALESCE(peak_cpu_percent, ?4), ?4) END,
            peak_memory_mb = CASE WHEN ?5 IS NULL THEN peak_memory_mb
                                  ELSE MAX(COALESCE(peak_memory_mb, ?5), ?5) END,
            updated_at = ?6
         WHERE execution_id = ?7",
        params![
            patch.current_operation,
            patch.progress_percentage.map(|p| p.clamp(0.0, 100.0)),
            patch.total_steps,
            stats.peak_cpu_percent,
            stats.peak_memory_mb,
            format_ts(now),
            execution_id,
        ],
    )?;

    if let Some(total) = patch.total_steps {
        let current: f64 = tx.query_row(
            "SELECT progress_percentage FROM executions WHERE execution_id = ?1",
            [execution_id],
            |row| row.get(0),
        )?;
        recompute_progress(tx, execution_id, total, current.max(state.progress))?;
    }
    Ok(())
}

fn set_status(
    tx: &Transaction<'_>,
    execution_id: &str,
    state: &RecordState,
    status: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if status.is_terminal() {
        let duration = (now - state.started_at)
            .num_microseconds()
            .map(|us| us as f64 / 1_000_000.0)
            .unwrap_or(0.0)
            .max(0.0);
        tx.execute(
            "UPDATE executions SET
                status = ?1,
                ended_at = ?2,
                duration_seconds = ?3,
                progress_percentage = CASE WHEN ?1 = 'success' THEN 100 ELSE progress_percentage END,
                updated_at = ?2
             WHERE execution_id = ?4",
            params![status.as_str(), format_ts(now), duration, execution_id],
        )?;
    } else {
        tx.execute(
            "UPDATE executions SET status = ?1, updated_at = ?2 WHERE execution_id = ?3",
            params![status.as_str(), format_ts(now), execution_id],
        )?;
    }
    Ok(())
}

fn recompute_progress(
    tx: &Transaction<'_>,
    execution_id: &str,
    total_steps: u32,
    current: f64,
) -> Result<f64, LedgerError> {
    if total_steps == 0 {
        return Ok(current);
    }
    let completed: i64 = tx.query_row(
        "SELECT COUNT(DISTINCT name) FROM execution_steps
         WHERE execution_id = ?1 AND status = 'success'",
        [execution_id],
        |row| row.get(0),
    )?;
    let derived = (completed as f64 / total_steps as f64 * 100.0).min(100.0);
    let progress = derived.max(current);
    if progress > current {
        tx.execute(
            "UPDATE executions SET progress_percentage = ?1 WHERE execution_id = ?2",
            params![progress, execution_id],
        )?;
    }
    Ok(progress)
}

fn insert_error(
    tx: &Transaction<'_>,
    execution_id: &str,
    kind: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<ErrorEntry, LedgerError> {
    tx.execute(
        "INSERT INTO execution_errors (execution_id, kind, message, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![execution_id, kind, message, format_ts(now)],
    )?;
    Ok(ErrorEntry {
        kind: kind.to_string(),
        message: message.to_string(),
        timestamp: now,
    })
}

// ---------------------------------------------------------------------------
// Column decoding
// ---------------------------------------------------------------------------

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_col<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn ts_col(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw)))
}

fn opt_ts_col(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(|r| ts_col(idx, r)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Subject;
    use crate::storage::open_pool;

    fn ledger() -> (tempfile::TempDir, ExecutionLedger) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("ledger.db")).unwrap();
        (dir, ExecutionLedger::new(pool))
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::ManualExecution, "ETH", "cli"))
            .await
            .unwrap();
        let rec = ledger.get(&id).await.unwrap();
        assert_eq!(rec.status, ExecutionStatus::Pending);
        assert!(rec.ended_at.is_none());
        assert!(rec.duration_seconds.is_none());
        assert_eq!(rec.subject, Subject::Single("ETH".into()));
        assert_eq!(id::parse_type(&id), Some(ExecutionType::ManualExecution));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, ledger) = ledger();
        let err = ledger
            .transition("nope", ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
        assert!(matches!(ledger.get("nope").await, Err(LedgerError::NotFound(_))));
        assert!(matches!(
            ledger.append_error("nope", "k", "m").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_cannot_skip_running() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::SymbolAddition, "BTC", "user"))
            .await
            .unwrap();
        let err = ledger
            .transition(&id, ExecutionStatus::Success, ExecutionPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(ledger.status(&id).await.unwrap(), ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_pending_record_can_be_force_cancelled() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledBacktest, "BTC", "scheduler"))
            .await
            .unwrap();
        ledger.cancel(&id, "operator", "stuck in pending").await.unwrap();

        let rec = ledger.get(&id).await.unwrap();
        assert_eq!(rec.status, ExecutionStatus::Cancelled);
        assert!(rec.ended_at.is_some());
        assert_eq!(rec.errors.len(), 1);
        assert_eq!(rec.errors[0].message, "stuck in pending");

        let err = ledger.cancel(&id, "operator", "again").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(ledger.get(&id).await.unwrap().errors.len(), 1);
    }

    #[tokio::test]
    async fn test_get_sees_steps_consistent_with_progress() {
        let (_dir, ledger) = ledger();
        let total = 40u32;
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledTraining, "ETH", "test").with_total_steps(total))
            .await
            .unwrap();
        ledger
            .transition(&id, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();

        let writer = {
            let ledger = ledger.clone();
            let id = id.clone();
            tokio::spawn(async move {
                for i in 0..total {
                    ledger
                        .append_step(&id, NewStep::new(format!("step-{}", i), StepStatus::Success))
                        .await
                        .unwrap();
                }
            })
        };

        loop {
            let rec = ledger.get(&id).await.unwrap();
            let expected = rec.steps.len() as f64 / total as f64 * 100.0;
            assert!(
                (rec.progress_percentage - expected).abs() < 1e-9,
                "progress {} with {} steps",
                rec.progress_percentage,
                rec.steps.len()
            );
            if rec.steps.len() == total as usize {
                break;
            }
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_patch_progress_never_decreases() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledBacktest, "BTC", "test"))
            .await
            .unwrap();
        ledger
            .transition(&id, ExecutionStatus::Running, ExecutionPatch::default().with_progress(40.0))
            .await
            .unwrap();
        ledger
            .update(&id, ExecutionPatch::operation("fetching").with_progress(10.0))
            .await
            .unwrap();
        let rec = ledger.get(&id).await.unwrap();
        assert_eq!(rec.progress_percentage, 40.0);
        assert_eq!(rec.current_operation.as_deref(), Some("fetching"));
    }

    #[tokio::test]
    async fn test_resource_stats_keep_peak() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledTraining, "BTC", "test"))
            .await
            .unwrap();
        let stats = |cpu, mem| ResourceStats {
            peak_cpu_percent: Some(cpu),
            peak_memory_mb: Some(mem),
        };
        ledger
            .transition(
                &id,
                ExecutionStatus::Running,
                ExecutionPatch::default().with_resource_stats(stats(80.0, 512.0)),
            )
            .await
            .unwrap();
        ledger
            .update(&id, ExecutionPatch::default().with_resource_stats(stats(20.0, 1024.0)))
            .await
            .unwrap();
        let rec = ledger.get(&id).await.unwrap();
        assert_eq!(rec.resource_stats.peak_cpu_percent, Some(80.0));
        assert_eq!(rec.resource_stats.peak_memory_mb, Some(1024.0));
    }

    #[tokio::test]
    async fn test_total_steps_patch_recomputes_progress() {
        let (_dir, ledger) = ledger();
        let id = ledger
            .create(NewExecution::new(ExecutionType::EmergencyRetrain, "BTC", "test"))
            .await
            .unwrap();
        ledger
            .transition(&id, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        let p = ledger
            .append_step(&id, NewStep::new("load", StepStatus::Success))
            .await
            .unwrap();
        assert_eq!(p, 0.0, "no total yet, progress unchanged");
        ledger
            .update(&id, ExecutionPatch::default().with_total_steps(4))
            .await
            .unwrap();
        assert_eq!(ledger.get(&id).await.unwrap().progress_percentage, 25.0);
    }
}
