//! Job runner contract and the bundled external-process runner.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::task::ScheduledTask;
use crate::config::RunnerConfig;
use crate::ledger::CancellationHandle;

/// Environment variable carrying the execution id into worker processes.
pub const EXECUTION_ID_ENV: &str = "JOBWARDEN_EXECUTION_ID";

/// How many bytes of worker stderr are kept for the error message.
const STDERR_TAIL_BYTES: usize = 2048;

/// How often a running worker's record is checked for cancellation.
const CANCEL_POLL: Duration = Duration::from_secs(2);

/// Everything a runner needs to perform one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub execution_id: String,
    pub task_id: String,
    pub subjects: Vec<String>,
    pub timeframes: Vec<String>,
    pub strategies: Vec<String>,
}

impl JobRequest {
    pub fn for_task(task: &ScheduledTask, execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            task_id: task.task_id.clone(),
            subjects: task.subjects.clone(),
            timeframes: task.target_timeframes.clone(),
            strategies: task.target_strategies.clone(),
        }
    }
}

/// Performs the actual work of a dispatch.
///
/// Implementations may report steps and progress through the ledger
/// themselves. Returning `Ok` means the work succeeded; the scheduler records
/// the final status.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: JobRequest, cancel: CancellationHandle) -> Result<()>;
}

/// Launches the configured worker program as a separate OS process.
pub struct CommandJobRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    termination_grace: Duration,
}

impl CommandJobRunner {
    pub fn new(config: &RunnerConfig, termination_grace: Duration) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            termination_grace,
        }
    }

    /// Argument list with placeholders substituted for `request`.
    pub fn render_args(&self, request: &JobRequest) -> Vec<String> {
        let first = request.subjects.first().cloned().unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{execution_id}", &request.execution_id)
                    .replace("{task_id}", &request.task_id)
                    .replace("{subjects}", &request.subjects.join(","))
                    .replace("{subject}", &first)
                    .replace("{strategies}", &request.strategies.join(","))
                    .replace("{timeframes}", &request.timeframes.join(","))
            })
            .collect()
    }
}

#[async_trait]
impl JobRunner for CommandJobRunner {
    async fn run(&self, request: JobRequest, cancel: CancellationHandle) -> Result<()> {
        let args = self.render_args(&request);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .env(EXECUTION_ID_ENV, &request.execution_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker '{}'", self.program))?;
        let pid = child.id();
        info!(
            execution_id = %request.execution_id,
            task = %request.task_id,
            pid = ?pid,
            program = %self.program,
            "worker started"
        );

        // Drain stderr concurrently so a chatty worker cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.context("failed to wait for worker")?,
            _ = cancel.wait_cancelled(CANCEL_POLL) => {
                warn!(execution_id = %request.execution_id, pid = ?pid, "execution cancelled, stopping worker");
                terminate_child(&mut child, self.termination_grace).await;
                anyhow::bail!("worker stopped after cancellation");
            }
        };

        let stderr = match stderr_reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if status.success() {
            debug!(execution_id = %request.execution_id, pid = ?pid, "worker exited cleanly");
            return Ok(());
        }

        anyhow::bail!(
            "worker exited with {}: {}",
            status,
            stderr_tail(&stderr, STDERR_TAIL_BYTES)
        )
    }
}

/// Last `max` bytes of `raw` as trimmed text.
fn stderr_tail(raw: &[u8], max: usize) -> String {
    let start = raw.len().saturating_sub(max);
    String::from_utf8_lossy(&raw[start..]).trim().to_string()
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(exit_code = status.code(), "worker exited after SIGTERM"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for worker after SIGTERM"),
        Err(_) => {
            warn!("worker did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ExecutionLedger, ExecutionPatch, ExecutionStatus, ExecutionType, NewExecution};
    use crate::storage::open_pool;

    fn request() -> JobRequest {
        JobRequest {
            execution_id: "scheduled_backtest_20250101_000000_deadbeef".into(),
            task_id: "majors".into(),
            subjects: vec!["BTC".into(), "ETH".into()],
            timeframes: vec!["1h".into(), "4h".into()],
            strategies: vec!["trend".into()],
        }
    }

    fn runner(program: &str, args: &[&str]) -> CommandJobRunner {
        CommandJobRunner::new(
            &RunnerConfig {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
                working_dir: None,
            },
            Duration::from_millis(200),
        )
    }

    async fn running_handle() -> (tempfile::TempDir, ExecutionLedger, CancellationHandle) {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = ExecutionLedger::new(open_pool(dir.path().join("r.db")).unwrap());
        let id = ledger
            .create(NewExecution::new(ExecutionType::ScheduledBacktest, "BTC", "test"))
            .await
            .unwrap();
        ledger
            .transition(&id, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        let handle = CancellationHandle::new(ledger.clone(), id);
        (dir, ledger, handle)
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let r = runner(
            "worker",
            &["--id={execution_id}", "{subject}", "{subjects}", "{task_id}", "{strategies}", "{timeframes}"],
        );
        assert_eq!(
            r.render_args(&request()),
            vec![
                "--id=scheduled_backtest_20250101_000000_deadbeef",
                "BTC",
                "BTC,ETH",
                "majors",
                "trend",
                "1h,4h",
            ]
        );
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        assert_eq!(stderr_tail(b"abcdef\n", 4), "def");
        assert_eq!(stderr_tail(b"", 4), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let (_dir, _ledger, handle) = running_handle().await;
        let r = runner("sh", &["-c", "echo boom >&2; exit 3"]);
        let err = r.run(request(), handle).await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("boom"), "{}", msg);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_sees_execution_id() {
        let (_dir, _ledger, handle) = running_handle().await;
        let r = runner("sh", &["-c", "test \"$JOBWARDEN_EXECUTION_ID\" = \"$0\"", "{execution_id}"]);
        r.run(request(), handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_worker() {
        let (_dir, ledger, handle) = running_handle().await;
        let id = handle.execution_id().to_string();
        let r = runner("sleep", &["30"]);
        let run = tokio::spawn(async move { r.run(request(), handle).await });
        ledger.cancel(&id, "operator", "stop").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("worker was not stopped")
            .unwrap();
        assert!(result.is_err());
    }
}
