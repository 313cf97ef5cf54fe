use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use jobwarden::config::JobwardenConfig;
use jobwarden::ledger::{ExecutionLedger, ExecutionStatus, ExecutionType, ListFilter};
use jobwarden::monitor::HealthMonitor;
use jobwarden::ServeOptions;

#[derive(Parser)]
#[command(
    name = "jobwarden",
    about = "Execution ledger, scheduler and process health monitor for backtest jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $JOBWARDEN_CONFIG or ./jobwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + health monitor)
    Serve {
        /// Do not run the scheduler loop
        #[arg(long)]
        no_scheduler: bool,

        /// Do not run the health monitor loop
        #[arg(long)]
        no_monitor: bool,
    },

    /// Manage scheduled tasks
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect and act on the worker process pool
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },

    /// Query the execution ledger
    Executions {
        #[command(subcommand)]
        action: ExecutionsAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List tasks with their runtime state
    List,

    /// Re-enable a task and clear its failure streak
    Enable {
        task_id: String,
    },

    /// Disable a task
    Disable {
        task_id: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum MonitorAction {
    /// Show the current worker pool
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Terminate orphaned/timed-out workers and reconcile the ledger now
    Cleanup,
}

#[derive(Subcommand)]
enum ExecutionsAction {
    /// List executions, newest first
    List {
        #[arg(long = "type")]
        execution_type: Option<ExecutionType>,

        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Only executions started within this many days
        #[arg(long)]
        days: Option<u32>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,

        #[arg(long)]
        json: bool,
    },

    /// Show one execution with steps and errors
    Show {
        execution_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Aggregate statistics over a window
    Stats {
        #[arg(long, default_value = "30")]
        days: u32,

        #[arg(long)]
        json: bool,
    },

    /// Delete executions older than N days
    Prune {
        #[arg(long)]
        older_than_days: u32,
    },

    /// Cancel a running execution
    Cancel {
        execution_id: String,

        #[arg(long, default_value = "Cancelled by operator")]
        reason: String,
    },
}

fn open_ledger(config: &JobwardenConfig) -> Result<ExecutionLedger> {
    let pool = jobwarden::storage::open_pool(&config.storage.db_path)?;
    Ok(ExecutionLedger::new(pool))
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = JobwardenConfig::resolve_path(cli.config.as_deref());
    let config = JobwardenConfig::load_or_init(&config_path)?;
    jobwarden::logging::init(&config.logging);

    match cli.command {
        Commands::Serve {
            no_scheduler,
            no_monitor,
        } => {
            tracing::info!(config = %config_path.display(), "starting jobwarden daemon");
            jobwarden::serve(
                config,
                ServeOptions {
                    scheduler: !no_scheduler,
                    monitor: !no_monitor,
                },
            )
            .await?;
        }
        Commands::Schedule { action } => {
            let ledger = open_ledger(&config)?;
            let scheduler = jobwarden::build_scheduler(&config, ledger);

            match action {
                ScheduleAction::List => {
                    let list = scheduler.list_tasks().await?;
                    if list.is_empty() {
                        println!("No tasks configured.");
                    } else {
                        println!(
                            "{:<24} | {:<12} | {:<12} | {:<7} | {:<8} | Last run",
                            "Task", "Type", "Frequency", "Enabled", "Failures"
                        );
                        println!("{:-<24}-|-{:-<12}-|-{:-<12}-|-{:-<7}-|-{:-<8}-|-{:-<20}", "", "", "", "", "", "");
                        for t in list {
                            println!(
                                "{:<24} | {:<12} | {:<12} | {:<7} | {:<8} | {}",
                                t.task_id,
                                t.task_type.execution_type(),
                                t.frequency,
                                t.enabled,
                                format!("{}/{}", t.consecutive_failures, t.max_failures),
                                fmt_opt(t.last_executed_at.map(|ts| ts.to_rfc3339())),
                            );
                        }
                    }
                }
                ScheduleAction::Enable { task_id } => {
                    scheduler.enable_task(&task_id).await?;
                    println!("Task '{}' enabled.", task_id);
                }
                ScheduleAction::Disable { task_id } => {
                    scheduler.disable_task(&task_id).await?;
                    println!("Task '{}' disabled.", task_id);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!("{} : {} ({})", run.at.to_rfc3339(), run.task_id, run.task_type.execution_type());
                        }
                    }
                }
            }
        }
        Commands::Monitor { action } => {
            let ledger = open_ledger(&config)?;
            let monitor = HealthMonitor::from_config(ledger, &config.monitor)
                .context("failed to build health monitor")?;

            match action {
                MonitorAction::Status { json } => {
                    let snapshot = monitor.health_snapshot().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    } else {
                        println!("\nWorker processes: {}", snapshot.matched_processes);
                        println!("Orphans:          {}", snapshot.orphan_processes);
                        println!("Over timeout:     {}", snapshot.over_timeout_processes);
                        println!("Total CPU:        {:.1}%", snapshot.total_cpu_percent);
                        println!("Total memory:     {:.1} MB", snapshot.total_memory_mb);
                        if !snapshot.processes.is_empty() {
                            println!();
                            println!("{:<8} | {:<8} | {:<6} | {:<8} | Execution", "PID", "Age(s)", "Orphan", "Mem(MB)");
                            println!("{:-<8}-|-{:-<8}-|-{:-<6}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
                            for p in &snapshot.processes {
                                println!(
                                    "{:<8} | {:<8} | {:<6} | {:<8.1} | {}",
                                    p.pid,
                                    p.age_seconds,
                                    p.is_orphan,
                                    p.memory_mb,
                                    fmt_opt(p.linked_execution_id.as_deref()),
                                );
                            }
                        }
                        println!();
                    }
                }
                MonitorAction::Cleanup => {
                    let cleanup = monitor.run_cleanup_now().await?;
                    let reconcile = monitor.reconcile_now().await?;
                    println!("Orphans cleaned:        {}", cleanup.orphans_cleaned);
                    println!("Timeouts handled:       {}", cleanup.timeouts_handled);
                    println!("Executions cancelled:   {}", cleanup.executions_cancelled);
                    println!("Stale records checked:  {}", reconcile.checked);
                    println!("Stale records cancelled: {}", reconcile.cancelled);
                }
            }
        }
        Commands::Executions { action } => {
            let ledger = open_ledger(&config)?;

            match action {
                ExecutionsAction::List {
                    execution_type,
                    subject,
                    status,
                    days,
                    limit,
                    offset,
                    json,
                } => {
                    let list = ledger
                        .list(ListFilter {
                            execution_type,
                            subject,
                            status,
                            since_days: days,
                            limit,
                            offset,
                        })
                        .await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&list)?);
                    } else if list.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<50} | {:<15} | {:>6} | {:<25} | Subject",
                            "Execution", "Status", "Pct", "Started"
                        );
                        println!("{:-<50}-|-{:-<15}-|-{:-<6}-|-{:-<25}-|-{:-<12}", "", "", "", "", "");
                        for e in list {
                            println!(
                                "{:<50} | {:<15} | {:>6.1} | {:<25} | {}",
                                e.execution_id,
                                e.status,
                                e.progress_percentage,
                                e.started_at.to_rfc3339(),
                                e.subject,
                            );
                        }
                    }
                }
                ExecutionsAction::Show { execution_id, json } => {
                    let record = ledger.get(&execution_id).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    } else {
                        println!("\nExecution:  {}", record.execution_id);
                        println!("Type:       {}", record.execution_type);
                        println!("Subject:    {}", record.subject);
                        println!("Status:     {}", record.status);
                        println!("Trigger:    {}", record.triggered_by);
                        println!("Progress:   {:.1}%", record.progress_percentage);
                        println!("Operation:  {}", fmt_opt(record.current_operation.as_deref()));
                        println!("Started:    {}", record.started_at.to_rfc3339());
                        println!("Ended:      {}", fmt_opt(record.ended_at.map(|t| t.to_rfc3339())));
                        println!("Duration:   {}", fmt_opt(record.duration_seconds.map(|d| format!("{:.1}s", d))));
                        if !record.steps.is_empty() {
                            println!("\nSteps:");
                            for s in &record.steps {
                                println!(" - {} [{}]", s.name, s.status.as_str());
                            }
                        }
                        if !record.errors.is_empty() {
                            println!("\nErrors:");
                            for e in &record.errors {
                                println!(" - {} {}: {}", e.timestamp.to_rfc3339(), e.kind, e.message);
                            }
                        }
                        println!();
                    }
                }
                ExecutionsAction::Stats { days, json } => {
                    let stats = ledger.aggregate_statistics(days).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&stats)?);
                    } else {
                        println!("\nLast {} days", stats.window_days);
                        println!("Total:          {}", stats.total);
                        println!("Success rate:   {:.1}%", stats.success_rate);
                        println!("Failed:         {}", stats.failed_count);
                        println!("Avg duration:   {:.1}s", stats.avg_duration_seconds);
                        println!("Compute hours:  {:.2}", stats.total_compute_hours);
                        for (name, t) in &stats.by_type {
                            println!(" - {:<22} total={} success={} failed={}", name, t.total, t.success, t.failed);
                        }
                        println!();
                    }
                }
                ExecutionsAction::Prune { older_than_days } => {
                    let report = ledger.prune(older_than_days).await?;
                    println!(
                        "Pruned {} executions ({} steps, {} errors).",
                        report.executions, report.steps, report.errors
                    );
                }
                ExecutionsAction::Cancel {
                    execution_id,
                    reason,
                } => {
                    ledger.cancel(&execution_id, "operator", &reason).await?;
                    println!("Execution '{}' cancelled.", execution_id);
                }
            }
        }
    }

    Ok(())
}
