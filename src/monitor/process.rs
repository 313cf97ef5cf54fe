//! OS process enumeration and signalling.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use super::MonitorError;

/// Raw facts about one OS process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command_line: String,
    /// `KEY=VALUE` entries. Empty when the environment is not readable.
    pub environ: Vec<String>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub started_at: DateTime<Utc>,
}

impl ProcessInfo {
    /// Value of `key` in the process environment.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.environ.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Signal sent during termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Source of process facts and the means to signal them.
///
/// Calls block; the monitor runs them on the blocking thread pool.
pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> Result<Vec<ProcessInfo>, MonitorError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver `signal`. A process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), MonitorError>;
}

// ---------------------------------------------------------------------------
// SystemProcessTable
// ---------------------------------------------------------------------------

/// The real process table via `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn processes(&self) -> Result<Vec<ProcessInfo>, MonitorError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| MonitorError::ProcessAccess("process table lock poisoned".into()))?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let list: Vec<ProcessInfo> = system
            .processes()
            .values()
            .filter(|p| p.status() != ProcessStatus::Zombie)
            // Linux reports each thread as its own entry.
            .filter(|p| p.thread_kind().is_none())
            .map(|p| {
                let command_line = p
                    .cmd()
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                ProcessInfo {
                    pid: p.pid().as_u32(),
                    parent_pid: p.parent().map(|pid| pid.as_u32()),
                    name: p.name().to_string_lossy().into_owned(),
                    command_line,
                    environ: p
                        .environ()
                        .iter()
                        .map(|e| e.to_string_lossy().into_owned())
                        .collect(),
                    cpu_percent: p.cpu_usage() as f64,
                    memory_mb: p.memory() as f64 / (1024.0 * 1024.0),
                    started_at: Utc
                        .timestamp_opt(p.start_time() as i64, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect();
        debug!(count = list.len(), "enumerated processes");
        Ok(list)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), MonitorError> {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(MonitorError::ProcessAccess(format!(
            "failed to signal pid {}: {}",
            pid, err
        )))
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), MonitorError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| MonitorError::ProcessAccess("process table lock poisoned".into()))?;
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = system.process(pid) else {
            return Ok(());
        };
        let sent = match signal {
            Signal::Terminate => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or_else(|| process.kill()),
            Signal::Kill => process.kill(),
        };
        if sent {
            Ok(())
        } else {
            Err(MonitorError::ProcessAccess(format!("failed to signal pid {}", pid)))
        }
    }
}
