//! Default task definitions written into a fresh configuration file.

use super::task::{Frequency, TaskDefinition, TaskType};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Return the default out-of-box task definitions.
pub fn defaults() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition {
            task_id: "backtest-majors-4h".to_string(),
            task_type: TaskType::Backtest,
            subjects: strings(&["BTC", "ETH"]),
            frequency: Frequency::Every4Hours,
            target_timeframes: strings(&["1h", "4h"]),
            target_strategies: strings(&["trend_following", "mean_reversion"]),
            enabled: true,
            max_failures: None,
        },
        TaskDefinition {
            task_id: "backtest-alts-daily".to_string(),
            task_type: TaskType::Backtest,
            subjects: strings(&["SOL", "BNB", "XRP"]),
            frequency: Frequency::Daily,
            target_timeframes: strings(&["4h", "1d"]),
            target_strategies: strings(&["trend_following"]),
            enabled: true,
            max_failures: None,
        },
        TaskDefinition {
            task_id: "training-weekly".to_string(),
            task_type: TaskType::Training,
            subjects: strings(&["BTC", "ETH", "SOL"]),
            frequency: Frequency::Weekly,
            target_timeframes: strings(&["1h"]),
            target_strategies: strings(&["ml_signal"]),
            enabled: true,
            max_failures: None,
        },
        TaskDefinition {
            task_id: "optimization-monthly".to_string(),
            task_type: TaskType::Optimization,
            subjects: strings(&["BTC", "ETH", "SOL", "BNB", "XRP"]),
            frequency: Frequency::Monthly,
            target_timeframes: strings(&["1h", "4h", "1d"]),
            target_strategies: strings(&["trend_following", "mean_reversion", "ml_signal"]),
            enabled: true,
            max_failures: Some(2),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_have_four_tasks() {
        assert_eq!(defaults().len(), 4);
    }

    #[test]
    fn test_all_defaults_enabled() {
        assert!(defaults().iter().all(|t| t.enabled));
    }

    #[test]
    fn test_default_ids_unique() {
        let mut ids: Vec<_> = defaults().into_iter().map(|t| t.task_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), defaults().len());
    }
}
