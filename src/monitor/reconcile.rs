//! Cancelling `Running` records whose worker no longer exists.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::classifier::ExecutionLinker;
use super::process::ProcessInfo;
use super::MonitorError;
use crate::ledger::{ExecutionLedger, ExecutionSummary, LedgerError};

/// Error kind and reason recorded on records reconciled away.
pub const RECONCILE_ERROR_KIND: &str = "consistency_check";
pub const RECONCILE_REASON: &str = "Process not found during consistency check";

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Running records old enough to be verified.
    pub checked: u32,
    pub cancelled: u32,
    /// Records kept because the evidence was inconclusive.
    pub ambiguous: u32,
}

/// Verdict for one running record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Too young to judge.
    Skip,
    Alive,
    Missing,
    Ambiguous(String),
}

/// Judge every record in `running` against the live `workers`.
///
/// A worker whose id links to a different execution is never taken as
/// evidence for this one. A subject-only match shared by several stale
/// records is ambiguous and keeps them all.
pub fn judge(
    running: &[ExecutionSummary],
    workers: &[ProcessInfo],
    linker: &dyn ExecutionLinker,
    confirmation: Duration,
    now: DateTime<Utc>,
) -> Vec<(String, Verdict)> {
    running
        .iter()
        .map(|record| {
            if now - record.started_at < confirmation {
                return (record.execution_id.clone(), Verdict::Skip);
            }
            let subjects = record.subject.items();
            let mut by_id = false;
            let mut by_subject = Vec::new();
            for worker in workers {
                let linked = linker.link(worker).execution_id;
                if linked.as_deref() == Some(record.execution_id.as_str()) {
                    by_id = true;
                    break;
                }
                if linked.is_none() && linker.references(worker, &record.execution_id, &subjects) {
                    by_subject.push(worker);
                }
            }

            let verdict = if by_id {
                Verdict::Alive
            } else if by_subject.is_empty() {
                Verdict::Missing
            } else {
                let shared = running
                    .iter()
                    .filter(|other| other.execution_id != record.execution_id)
                    .filter(|other| now - other.started_at >= confirmation)
                    .any(|other| {
                        let their = other.subject.items();
                        by_subject
                            .iter()
                            .any(|w| linker.references(w, &other.execution_id, &their))
                    });
                if shared {
                    Verdict::Ambiguous(format!(
                        "worker pid {} matches several running executions by subject",
                        by_subject[0].pid
                    ))
                } else {
                    Verdict::Alive
                }
            };
            (record.execution_id.clone(), verdict)
        })
        .collect()
}

/// Apply verdicts to the ledger.
pub async fn reconcile(
    ledger: &ExecutionLedger,
    workers: &[ProcessInfo],
    linker: &dyn ExecutionLinker,
    confirmation: Duration,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, MonitorError> {
    let running = ledger.running().await?;
    let mut report = ReconcileReport::default();

    for (execution_id, verdict) in judge(&running, workers, linker, confirmation, now) {
        match verdict {
            Verdict::Skip => continue,
            Verdict::Alive => {
                report.checked += 1;
                debug!(execution_id = %execution_id, "worker found");
            }
            Verdict::Ambiguous(reason) => {
                report.checked += 1;
                report.ambiguous += 1;
                let err = MonitorError::ReconciliationAmbiguity {
                    execution_id: execution_id.clone(),
                    reason,
                };
                warn!(error = %err, "keeping execution");
            }
            Verdict::Missing => {
                report.checked += 1;
                match ledger
                    .cancel(&execution_id, RECONCILE_ERROR_KIND, RECONCILE_REASON)
                    .await
                {
                    Ok(()) => {
                        report.cancelled += 1;
                        info!(execution_id = %execution_id, "stale execution cancelled");
                    }
                    // Finished between the listing and the cancel.
                    Err(LedgerError::InvalidTransition { .. }) | Err(LedgerError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::ledger::{ExecutionStatus, ExecutionType, Subject};
    use crate::monitor::classifier::RegexLinker;

    fn record(id: &str, subject: &str, age_minutes: i64, now: DateTime<Utc>) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: id.into(),
            execution_type: ExecutionType::ScheduledBacktest,
            subject: Subject::from(subject),
            status: ExecutionStatus::Running,
            triggered_by: "scheduler".into(),
            current_operation: None,
            progress_percentage: 0.0,
            started_at: now - Duration::minutes(age_minutes),
            ended_at: None,
            duration_seconds: None,
            error_count: 0,
        }
    }

    fn worker(cmd: &str) -> ProcessInfo {
        ProcessInfo {
            pid: 77,
            parent_pid: Some(1),
            name: "python3".into(),
            command_line: cmd.into(),
            environ: vec![],
            cpu_percent: 0.0,
            memory_mb: 0.0,
            started_at: Utc::now(),
        }
    }

    const A: &str = "scheduled_backtest_20250101_000000_aaaaaaaa";
    const B: &str = "scheduled_backtest_20250101_000000_bbbbbbbb";

    fn run(running: &[ExecutionSummary], workers: &[ProcessInfo], now: DateTime<Utc>) -> Vec<Verdict> {
        let linker = RegexLinker::from_config(&MonitorConfig::default()).unwrap();
        judge(running, workers, &linker, Duration::minutes(60), now)
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn test_young_record_skipped() {
        let now = Utc::now();
        assert_eq!(run(&[record(A, "BTC", 10, now)], &[], now), vec![Verdict::Skip]);
    }

    #[test]
    fn test_missing_and_alive_by_id() {
        let now = Utc::now();
        let workers = [worker(&format!("python3 backtest.py --execution-id {}", A))];
        let verdicts = run(&[record(A, "BTC", 90, now), record(B, "BTC", 90, now)], &workers, now);
        assert_eq!(verdicts, vec![Verdict::Alive, Verdict::Missing]);
    }

    #[test]
    fn test_subject_match_keeps_record() {
        let now = Utc::now();
        let workers = [worker("python3 backtest.py --symbols ETH")];
        assert_eq!(run(&[record(A, "ETH", 90, now)], &workers, now), vec![Verdict::Alive]);
    }

    #[test]
    fn test_shared_subject_is_ambiguous() {
        let now = Utc::now();
        let workers = [worker("python3 backtest.py --symbols ETH")];
        let verdicts = run(&[record(A, "ETH", 90, now), record(B, "ETH", 90, now)], &workers, now);
        assert!(verdicts.iter().all(|v| matches!(v, Verdict::Ambiguous(_))));
    }
}
