//! Execution id generation: `{type}_{YYYYMMDD}_{HHMMSS}_{random8hex}`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::ExecutionType;

/// Generate a fresh execution id for `execution_type`, stamped with `now`.
pub fn generate(execution_type: ExecutionType, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        execution_type.as_str(),
        now.format("%Y%m%d_%H%M%S"),
        &random[..8]
    )
}

/// Regex source matching any execution id, with the type in group 1.
pub fn pattern() -> String {
    let types = ExecutionType::ALL
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join("|");
    format!(r"\b(?:{})_\d{{8}}_\d{{6}}_[0-9a-f]{{8}}\b", types)
}

/// Recover the execution type from a well-formed id.
pub fn parse_type(execution_id: &str) -> Option<ExecutionType> {
    ExecutionType::ALL.iter().copied().find(|t| {
        execution_id
            .strip_prefix(t.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .map(is_stamp_and_suffix)
            .unwrap_or(false)
    })
}

fn is_stamp_and_suffix(rest: &str) -> bool {
    let parts: Vec<&str> = rest.split('_').collect();
    parts.len() == 3
        && parts[0].len() == 8
        && parts[0].chars().all(|c| c.is_ascii_digit())
        && parts[1].len() == 6
        && parts[1].chars().all(|c| c.is_ascii_digit())
        && parts[2].len() == 8
        && parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
