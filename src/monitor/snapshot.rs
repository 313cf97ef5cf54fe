//! Per-cycle views of the worker pool. Never persisted.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::classifier::Link;
use super::process::ProcessInfo;

/// A worker process as seen during one monitor cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub process_name: String,
    pub command_line: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub created_at: DateTime<Utc>,
    pub parent_pid: Option<u32>,
    pub is_orphan: bool,
    pub age_seconds: i64,
    pub over_timeout: bool,
    pub linked_execution_id: Option<String>,
    pub linked_subject: Option<String>,
}

impl ProcessSnapshot {
    /// Derive a snapshot from raw process facts.
    ///
    /// `live_pids` is the full set of pids seen in the same scan; a parent
    /// outside it, or pid 1, makes the process an orphan.
    pub fn derive(
        info: &ProcessInfo,
        link: Link,
        live_pids: &HashSet<u32>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let age_seconds = (now - info.started_at).num_seconds().max(0);
        let is_orphan = match info.parent_pid {
            None | Some(0) | Some(1) => true,
            Some(ppid) => !live_pids.contains(&ppid),
        };
        Self {
            pid: info.pid,
            process_name: info.name.clone(),
            command_line: info.command_line.clone(),
            cpu_percent: info.cpu_percent,
            memory_mb: info.memory_mb,
            created_at: info.started_at,
            parent_pid: info.parent_pid,
            is_orphan,
            age_seconds,
            over_timeout: age_seconds > max_age.num_seconds(),
            linked_execution_id: link.execution_id,
            linked_subject: link.subject,
        }
    }
}

/// Monitor state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub monitoring_active: bool,
    pub check_interval_secs: u64,
    pub max_execution_hours: u64,
    pub orphan_grace_minutes: u64,
    pub reconcile_confirmation_minutes: u64,
    pub matched_processes: usize,
    pub orphan_processes: usize,
    pub over_timeout_processes: usize,
    pub total_cpu_percent: f64,
    pub total_memory_mb: f64,
    pub processes: Vec<ProcessSnapshot>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}
