//! Selecting and terminating runaway workers.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::process::{ProcessTable, Signal};
use super::snapshot::ProcessSnapshot;
use super::MonitorError;

/// Error kind recorded on executions cancelled by cleanup.
pub const CLEANUP_ERROR_KIND: &str = "process_cleanup";

/// Why a worker is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    Timeout { hours: u64 },
    Orphan,
}

impl CleanupReason {
    /// Text recorded into the execution's error list.
    pub fn message(&self) -> String {
        match self {
            CleanupReason::Timeout { hours } => format!("Timeout after {} hours", hours),
            CleanupReason::Orphan => "Orphan process cleanup".to_string(),
        }
    }
}

/// Thresholds applied to a scan.
#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    pub max_execution_hours: u64,
    pub orphan_grace: Duration,
}

/// A worker chosen for termination.
#[derive(Debug, Clone)]
pub struct CleanupTarget {
    pub process: ProcessSnapshot,
    pub reason: CleanupReason,
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub orphans_cleaned: u32,
    pub timeouts_handled: u32,
    pub executions_cancelled: u32,
}

/// Workers to terminate. Timeout wins over orphan for the same process.
pub fn select_targets(processes: &[ProcessSnapshot], policy: &CleanupPolicy) -> Vec<CleanupTarget> {
    processes
        .iter()
        .filter_map(|p| {
            let reason = if p.over_timeout {
                CleanupReason::Timeout {
                    hours: policy.max_execution_hours,
                }
            } else if p.is_orphan && p.age_seconds > policy.orphan_grace.num_seconds() {
                CleanupReason::Orphan
            } else {
                return None;
            };
            Some(CleanupTarget {
                process: p.clone(),
                reason,
            })
        })
        .collect()
}

/// Pids that are gone after termination, and pids that could not be
/// signalled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationResult {
    pub terminated: Vec<u32>,
    pub force_killed: Vec<u32>,
    pub failed: Vec<u32>,
}

impl TerminationResult {
    pub fn is_gone(&self, pid: u32) -> bool {
        !self.failed.contains(&pid)
    }
}

/// Two-phase termination: SIGTERM every pid, wait `grace` once, SIGKILL the
/// survivors.
pub async fn terminate_all(
    table: Arc<dyn ProcessTable>,
    pids: Vec<u32>,
    grace: StdDuration,
) -> Result<TerminationResult, MonitorError> {
    if pids.is_empty() {
        return Ok(TerminationResult::default());
    }

    let signalled = {
        let table = Arc::clone(&table);
        tokio::task::spawn_blocking(move || {
            let mut result = TerminationResult::default();
            let mut sent = Vec::new();
            for pid in pids {
                match table.signal(pid, Signal::Terminate) {
                    Ok(()) => sent.push(pid),
                    Err(e) => {
                        warn!(pid, error = %e, "SIGTERM failed");
                        result.failed.push(pid);
                    }
                }
            }
            (result, sent)
        })
        .await
        .map_err(|e| MonitorError::ProcessAccess(format!("signal task aborted: {}", e)))?
    };
    let (mut result, sent) = signalled;

    tokio::time::sleep(grace).await;

    let result = tokio::task::spawn_blocking(move || {
        for pid in sent {
            if !table.is_alive(pid) {
                debug!(pid, "worker exited after SIGTERM");
                result.terminated.push(pid);
                continue;
            }
            match table.signal(pid, Signal::Kill) {
                Ok(()) => {
                    info!(pid, "worker force-killed");
                    result.force_killed.push(pid);
                    result.terminated.push(pid);
                }
                Err(e) => {
                    warn!(pid, error = %e, "SIGKILL failed");
                    result.failed.push(pid);
                }
            }
        }
        result
    })
    .await
    .map_err(|e| MonitorError::ProcessAccess(format!("signal task aborted: {}", e)))?;

    Ok(result)
}
