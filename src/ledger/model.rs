//! Ledger record types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionType
// ---------------------------------------------------------------------------

/// What kind of job an execution record tracks.
///
/// The snake_case form is both the stored value and the execution id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    SymbolAddition,
    ScheduledBacktest,
    ScheduledTraining,
    MonthlyOptimization,
    EmergencyRetrain,
    ManualExecution,
}

impl ExecutionType {
    pub const ALL: [ExecutionType; 6] = [
        ExecutionType::SymbolAddition,
        ExecutionType::ScheduledBacktest,
        ExecutionType::ScheduledTraining,
        ExecutionType::MonthlyOptimization,
        ExecutionType::EmergencyRetrain,
        ExecutionType::ManualExecution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::SymbolAddition => "symbol_addition",
            ExecutionType::ScheduledBacktest => "scheduled_backtest",
            ExecutionType::ScheduledTraining => "scheduled_training",
            ExecutionType::MonthlyOptimization => "monthly_optimization",
            ExecutionType::EmergencyRetrain => "emergency_retrain",
            ExecutionType::ManualExecution => "manual_execution",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown execution type '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Success,
        ExecutionStatus::PartialSuccess,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::PartialSuccess => "partial_success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::PartialSuccess
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Pending -> Running -> terminal`. `Running -> Running` is accepted as a
    /// plain progress update.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => next == ExecutionStatus::Running,
            ExecutionStatus::Running => next == ExecutionStatus::Running || next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown execution status '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// The identifier(s) a job concerns: one symbol, or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Single(String),
    Many(Vec<String>),
}

impl Subject {
    /// All identifiers in order.
    pub fn items(&self) -> Vec<&str> {
        match self {
            Subject::Single(s) => vec![s.as_str()],
            Subject::Many(items) => items.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.items().join(","))
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Subject::Single(s.to_string())
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Subject::Single(s)
    }
}

impl From<Vec<String>> for Subject {
    fn from(items: Vec<String>) -> Self {
        if items.len() == 1 {
            Subject::Single(items.into_iter().next().unwrap_or_default())
        } else {
            Subject::Many(items)
        }
    }
}

// ---------------------------------------------------------------------------
// Steps and errors
// ---------------------------------------------------------------------------

/// Status of a single step inside an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// One entry in an execution's append-only step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Input for [`crate::ledger::ExecutionLedger::append_step`].
#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl NewStep {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            result: None,
            error_message: None,
            duration_seconds: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_duration_seconds(mut self, secs: f64) -> Self {
        self.duration_seconds = Some(secs);
        self
    }
}

/// One entry in an execution's append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Peak resource usage a worker reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Full execution record, including child collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub subject: Subject,
    pub status: ExecutionStatus,
    pub triggered_by: String,
    pub current_operation: Option<String>,
    pub progress_percentage: f64,
    pub total_steps: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub resource_stats: ResourceStats,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub steps: Vec<Step>,
    pub errors: Vec<ErrorEntry>,
}

/// Row returned by [`crate::ledger::ExecutionLedger::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub subject: Subject,
    pub status: ExecutionStatus,
    pub triggered_by: String,
    pub current_operation: Option<String>,
    pub progress_percentage: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_count: u32,
}

/// Input for creating a record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_type: ExecutionType,
    pub subject: Subject,
    pub triggered_by: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub total_steps: u32,
}

impl NewExecution {
    pub fn new(
        execution_type: ExecutionType,
        subject: impl Into<Subject>,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            execution_type,
            subject: subject.into(),
            triggered_by: triggered_by.into(),
            metadata: serde_json::Map::new(),
            total_steps: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_total_steps(mut self, total_steps: u32) -> Self {
        self.total_steps = total_steps;
        self
    }
}

/// Partial update applied alongside (or instead of) a status transition.
///
/// Only the fields that are `Some` are written.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub current_operation: Option<String>,
    pub progress_percentage: Option<f64>,
    pub total_steps: Option<u32>,
    pub resource_stats: Option<ResourceStats>,
}

impl ExecutionPatch {
    pub fn operation(op: impl Into<String>) -> Self {
        Self {
            current_operation: Some(op.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, pct: f64) -> Self {
        self.progress_percentage = Some(pct);
        self
    }

    pub fn with_total_steps(mut self, total: u32) -> Self {
        self.total_steps = Some(total);
        self
    }

    pub fn with_resource_stats(mut self, stats: ResourceStats) -> Self {
        self.resource_stats = Some(stats);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.current_operation.is_none()
            && self.progress_percentage.is_none()
            && self.total_steps.is_none()
            && self.resource_stats.is_none()
    }
}

/// Filters for [`crate::ledger::ExecutionLedger::list`].
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub execution_type: Option<ExecutionType>,
    pub subject: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub since_days: Option<u32>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            execution_type: None,
            subject: None,
            status: None,
            since_days: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl ListFilter {
    /// Every record currently in `status`.
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            limit: u32::MAX,
            ..Self::default()
        }
    }
}

/// Per-type counters inside [`ExecutionStatistics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeStatistics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub avg_duration_seconds: f64,
}

/// Aggregate view over a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub window_days: u32,
    pub total: u64,
    /// Percentage of records in the window that ended in `Success`.
    pub success_rate: f64,
    pub failed_count: u64,
    pub avg_duration_seconds: f64,
    pub total_compute_hours: f64,
    pub by_type: BTreeMap<String, TypeStatistics>,
}

/// Counts returned by [`crate::ledger::ExecutionLedger::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub executions: u64,
    pub steps: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Running));
        for t in [Success, PartialSuccess, Failed, Cancelled] {
            assert!(Running.can_transition_to(t));
            assert!(t.is_terminal());
            for next in ExecutionStatus::ALL {
                assert!(!t.can_transition_to(next), "{} -> {} accepted", t, next);
            }
        }
    }

    #[test]
    fn test_status_and_type_parse() {
        for st in ExecutionStatus::ALL {
            assert_eq!(st.as_str().parse::<ExecutionStatus>().unwrap(), st);
        }
        for t in ExecutionType::ALL {
            assert_eq!(t.as_str().parse::<ExecutionType>().unwrap(), t);
        }
        assert!("bogus".parse::<ExecutionType>().is_err());
    }

    #[test]
    fn test_subject_json_shapes() {
        let single: Subject = serde_json::from_str("\"BTC\"").unwrap();
        assert_eq!(single, Subject::Single("BTC".into()));
        let many: Subject = serde_json::from_str("[\"BTC\",\"ETH\"]").unwrap();
        assert_eq!(many.items(), vec!["BTC", "ETH"]);
        assert_eq!(many.to_string(), "BTC,ETH");
    }

    #[test]
    fn test_single_item_vec_collapses() {
        let s: Subject = vec!["SOL".to_string()].into();
        assert_eq!(s, Subject::Single("SOL".into()));
    }
}
