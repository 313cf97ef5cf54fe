//! Deciding which processes are workers and which execution they belong to.

use regex::Regex;

use super::process::ProcessInfo;
use super::MonitorError;
use crate::config::MonitorConfig;
use crate::ledger::id;
use crate::scheduler::runner::EXECUTION_ID_ENV;

/// Decides whether a process belongs to the worker pool.
pub trait ProcessClassifier: Send + Sync {
    fn is_worker(&self, process: &ProcessInfo) -> bool;
}

/// Worker = image name starts with a runtime name AND the command line
/// contains a keyword. Both comparisons ignore case.
pub struct KeywordClassifier {
    runtime_names: Vec<String>,
    keywords: Vec<String>,
}

impl KeywordClassifier {
    pub fn new(runtime_names: &[String], keywords: &[String]) -> Self {
        Self {
            runtime_names: runtime_names.iter().map(|s| s.to_lowercase()).collect(),
            keywords: keywords.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(&config.runtime_names, &config.keywords)
    }
}

impl ProcessClassifier for KeywordClassifier {
    fn is_worker(&self, process: &ProcessInfo) -> bool {
        let name = process.name.to_lowercase();
        let runtime = self.runtime_names.iter().any(|r| name.starts_with(r.as_str()));
        if !runtime {
            return false;
        }
        let cmd = process.command_line.to_lowercase();
        self.keywords.iter().any(|k| cmd.contains(k.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

/// Best-effort association between a process and the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub execution_id: Option<String>,
    pub subject: Option<String>,
}

/// Extracts execution ids and subjects from processes.
pub trait ExecutionLinker: Send + Sync {
    fn link(&self, process: &ProcessInfo) -> Link;

    /// Whether `process` is evidence that the execution is still alive.
    fn references(&self, process: &ProcessInfo, execution_id: &str, subjects: &[&str]) -> bool;
}

/// Regex-driven linker. Execution ids are matched against the id format of
/// every known execution type; subjects come from configurable patterns whose
/// first capture group is the subject.
pub struct RegexLinker {
    id_pattern: Regex,
    subject_patterns: Vec<Regex>,
}

impl RegexLinker {
    pub fn new(subject_patterns: &[String]) -> Result<Self, MonitorError> {
        Ok(Self {
            id_pattern: Regex::new(&id::pattern())?,
            subject_patterns: subject_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::new(&config.subject_patterns)
    }

    fn execution_id(&self, process: &ProcessInfo) -> Option<String> {
        if let Some(m) = self.id_pattern.find(&process.command_line) {
            return Some(m.as_str().to_string());
        }
        process
            .env_var(EXECUTION_ID_ENV)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn subject(&self, process: &ProcessInfo) -> Option<String> {
        self.subject_patterns.iter().find_map(|re| {
            re.captures(&process.command_line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
    }
}

impl ExecutionLinker for RegexLinker {
    fn link(&self, process: &ProcessInfo) -> Link {
        Link {
            execution_id: self.execution_id(process),
            subject: self.subject(process),
        }
    }

    fn references(&self, process: &ProcessInfo, execution_id: &str, subjects: &[&str]) -> bool {
        if process.command_line.contains(execution_id)
            || process.env_var(EXECUTION_ID_ENV) == Some(execution_id)
        {
            return true;
        }
        let linked = self.subject(process);
        subjects.iter().any(|subject| {
            linked
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(subject))
                || command_tokens(&process.command_line).any(|t| t.eq_ignore_ascii_case(subject))
        })
    }
}

/// Command line split on whitespace, commas and `=`.
fn command_tokens(command_line: &str) -> impl Iterator<Item = &str> {
    command_line
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=')
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn proc(name: &str, cmd: &str, environ: &[&str]) -> ProcessInfo {
        ProcessInfo {
            pid: 42,
            parent_pid: Some(1),
            name: name.into(),
            command_line: cmd.into(),
            environ: environ.iter().map(|s| s.to_string()).collect(),
            cpu_percent: 0.0,
            memory_mb: 0.0,
            started_at: Utc::now(),
        }
    }

    fn linker() -> RegexLinker {
        RegexLinker::from_config(&MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_classifier_needs_runtime_and_keyword() {
        let c = KeywordClassifier::from_config(&MonitorConfig::default());
        assert!(c.is_worker(&proc("python3.11", "python3 -m backtest_worker --symbols BTC", &[])));
        assert!(c.is_worker(&proc("Python", "python run_TRAINING.py", &[])));
        assert!(!c.is_worker(&proc("python3", "python3 -m http.server", &[])));
        assert!(!c.is_worker(&proc("bash", "bash backtest.sh", &[])));
    }

    #[test]
    fn test_link_from_command_line() {
        let p = proc(
            "python3",
            "python3 -m backtest_worker --execution-id scheduled_backtest_20250301_120000_0a1b2c3d --symbols SOL",
            &[],
        );
        let link = linker().link(&p);
        assert_eq!(
            link.execution_id.as_deref(),
            Some("scheduled_backtest_20250301_120000_0a1b2c3d")
        );
        assert_eq!(link.subject.as_deref(), Some("SOL"));
    }

    #[test]
    fn test_link_falls_back_to_environment() {
        let p = proc(
            "python3",
            "python3 train.py",
            &["JOBWARDEN_EXECUTION_ID=scheduled_training_20250301_120000_ffffffff"],
        );
        let link = linker().link(&p);
        assert_eq!(
            link.execution_id.as_deref(),
            Some("scheduled_training_20250301_120000_ffffffff")
        );
        assert_eq!(link.subject, None);
    }

    #[test]
    fn test_references_by_subject_token() {
        let p = proc("python3", "python3 backtest.py --pairs eth,btc", &[]);
        let l = linker();
        assert!(l.references(&p, "manual_execution_20250101_000000_00000000", &["BTC"]));
        assert!(!l.references(&p, "manual_execution_20250101_000000_00000000", &["SOL"]));
    }

    #[test]
    fn test_bad_subject_pattern_rejected() {
        assert!(RegexLinker::new(&["(unclosed".to_string()]).is_err());
    }
}
