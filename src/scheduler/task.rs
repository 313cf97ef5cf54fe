//! Scheduled task definitions and calendar period keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::ExecutionType;

// ---------------------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------------------

/// How often a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Every4Hours,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Canonical key of the period containing `at`.
    ///
    /// Two instants fall in the same period iff their keys are equal; this is
    /// what prevents a fine-grained tick loop from firing a task twice.
    pub fn period_key(&self, at: DateTime<Utc>) -> String {
        match self {
            Frequency::Hourly => at.format("%Y-%m-%d-%H").to_string(),
            Frequency::Every4Hours => {
                format!("{}-H{:02}", at.format("%Y-%m-%d"), at.hour() / 4 * 4)
            }
            Frequency::Daily => at.format("%Y-%m-%d").to_string(),
            Frequency::Weekly => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Frequency::Monthly => at.format("%Y-%m").to_string(),
        }
    }

    /// Six-field cron expression firing at the start of every period.
    pub fn cron_expr(&self) -> &'static str {
        match self {
            Frequency::Hourly => "0 0 * * * *",
            Frequency::Every4Hours => "0 0 */4 * * *",
            Frequency::Daily => "0 0 0 * * *",
            Frequency::Weekly => "0 0 0 * * Mon",
            Frequency::Monthly => "0 0 0 1 * *",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Every4Hours => "every4_hours",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Category of recurring work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Backtest,
    Training,
    Optimization,
    Retrain,
}

impl TaskType {
    /// Ledger execution type recorded for a dispatch of this task.
    pub fn execution_type(&self) -> ExecutionType {
        match self {
            TaskType::Backtest => ExecutionType::ScheduledBacktest,
            TaskType::Training => ExecutionType::ScheduledTraining,
            TaskType::Optimization => ExecutionType::MonthlyOptimization,
            TaskType::Retrain => ExecutionType::EmergencyRetrain,
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backtest" => Ok(TaskType::Backtest),
            "training" => Ok(TaskType::Training),
            "optimization" => Ok(TaskType::Optimization),
            "retrain" => Ok(TaskType::Retrain),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledTask
// ---------------------------------------------------------------------------

/// Definition of a recurring job as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub task_type: TaskType,
    pub subjects: Vec<String>,
    pub frequency: Frequency,
    #[serde(default)]
    pub target_timeframes: Vec<String>,
    #[serde(default)]
    pub target_strategies: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

/// A task definition plus its runtime state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub task_type: TaskType,
    pub subjects: Vec<String>,
    pub frequency: Frequency,
    pub target_timeframes: Vec<String>,
    pub target_strategies: Vec<String>,
    pub enabled: bool,
    /// Tick time of the last successful dispatch.
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Tick time of the last dispatch, successful or not.
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub max_failures: u32,
}

impl ScheduledTask {
    pub fn from_definition(def: &TaskDefinition, default_max_failures: u32) -> Self {
        Self {
            task_id: def.task_id.clone(),
            task_type: def.task_type,
            subjects: def.subjects.clone(),
            frequency: def.frequency,
            target_timeframes: def.target_timeframes.clone(),
            target_strategies: def.target_strategies.clone(),
            enabled: def.enabled,
            last_executed_at: None,
            last_attempted_at: None,
            consecutive_failures: 0,
            max_failures: def.max_failures.unwrap_or(default_max_failures).max(1),
        }
    }

    /// Whether the task should fire on a tick at `now`.
    ///
    /// Any dispatch, failed or not, uses up its period.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_attempted_at.max(self.last_executed_at) {
            None => true,
            Some(last) => self.frequency.period_key(last) != self.frequency.period_key(now),
        }
    }

    /// Record a successful run fired at `at`.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_executed_at = Some(at);
        self.last_attempted_at = Some(at);
        self.consecutive_failures = 0;
    }

    /// Record a failed run fired at `at`. Returns true if this failure
    /// disabled the task.
    pub fn record_failure(&mut self, at: DateTime<Utc>) -> bool {
        self.last_attempted_at = Some(at);
        self.consecutive_failures += 1;
        if self.enabled && self.consecutive_failures >= self.max_failures {
            self.enabled = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn task(frequency: Frequency) -> ScheduledTask {
        ScheduledTask::from_definition(
            &TaskDefinition {
                task_id: "t".into(),
                task_type: TaskType::Backtest,
                subjects: vec!["BTC".into()],
                frequency,
                target_timeframes: vec![],
                target_strategies: vec![],
                enabled: true,
                max_failures: Some(3),
            },
            5,
        )
    }

    #[test]
    fn test_period_keys() {
        let t = at(2025, 3, 14, 13, 59);
        assert_eq!(Frequency::Hourly.period_key(t), "2025-03-14-13");
        assert_eq!(Frequency::Every4Hours.period_key(t), "2025-03-14-H12");
        assert_eq!(Frequency::Daily.period_key(t), "2025-03-14");
        assert_eq!(Frequency::Weekly.period_key(t), "2025-W11");
        assert_eq!(Frequency::Monthly.period_key(t), "2025-03");
    }

    #[test]
    fn test_hourly_fires_once_per_hour() {
        let mut t = task(Frequency::Hourly);
        assert!(t.is_due(at(2025, 1, 1, 10, 0)));
        t.record_success(at(2025, 1, 1, 10, 0));
        for minute in 1..60 {
            assert!(!t.is_due(at(2025, 1, 1, 10, minute)), "double fire at :{}", minute);
        }
        assert!(t.is_due(at(2025, 1, 1, 11, 0)));
    }

    #[test]
    fn test_weekly_crosses_year_boundary_by_iso_week() {
        let mut t = task(Frequency::Weekly);
        // 2024-12-30 is Monday of ISO week 2025-W01.
        t.record_success(at(2024, 12, 30, 0, 0));
        assert!(!t.is_due(at(2025, 1, 3, 12, 0)));
        assert!(t.is_due(at(2025, 1, 6, 0, 0)));
    }

    #[test]
    fn test_failures_disable_at_max() {
        let mut t = task(Frequency::Daily);
        assert!(!t.record_failure(at(2025, 1, 1, 0, 0)));
        assert!(!t.record_failure(at(2025, 1, 2, 0, 0)));
        assert!(t.record_failure(at(2025, 1, 3, 0, 0)));
        assert!(!t.enabled);
        assert_eq!(t.consecutive_failures, 3);
        assert!(!t.is_due(at(2030, 1, 1, 0, 0)));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut t = task(Frequency::Daily);
        t.record_failure(at(2024, 12, 31, 0, 0));
        t.record_success(at(2025, 1, 1, 0, 0));
        assert_eq!(t.consecutive_failures, 0);
        assert!(t.enabled);
    }

    #[test]
    fn test_failure_uses_up_period() {
        let mut t = task(Frequency::Daily);
        t.record_failure(at(2025, 5, 10, 9, 0));
        assert!(t.last_executed_at.is_none());
        for minute in 1..5 {
            assert!(!t.is_due(at(2025, 5, 10, 9, minute)), "refired at 09:{:02}", minute);
        }
        assert!(!t.is_due(at(2025, 5, 10, 23, 59)));
        assert!(t.is_due(at(2025, 5, 11, 0, 0)));
    }

    #[test]
    fn test_cron_exprs_parse() {
        for f in [
            Frequency::Hourly,
            Frequency::Every4Hours,
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
        ] {
            cron::Schedule::from_str(f.cron_expr()).unwrap();
        }
    }
}
