//! Smoke tests -- verify the binary runs and key subcommands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn jobwarden(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("jobwarden").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("JOBWARDEN_CONFIG")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("jobwarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Execution ledger"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("jobwarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("jobwarden"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("jobwarden")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--no-monitor"));
}

#[test]
fn test_schedule_list_writes_default_config() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("backtest-majors-4h"));
    assert!(dir.path().join("jobwarden.toml").exists());
    assert!(dir.path().join("data").join("jobwarden.db").exists());
}

#[test]
fn test_schedule_disable_then_dry_run() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["schedule", "disable", "backtest-majors-4h"])
        .assert()
        .success();
    jobwarden(&dir)
        .args(["schedule", "dry-run", "--hours", "48"])
        .assert()
        .success()
        .stdout(predicates::str::contains("backtest-alts-daily"))
        .stdout(predicates::str::contains("backtest-majors-4h").not());
}

#[test]
fn test_schedule_enable_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["schedule", "enable", "no-such-task"])
        .assert()
        .failure();
}

#[test]
fn test_executions_list_empty() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["executions", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No executions found."));
}

#[test]
fn test_executions_stats_json() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["executions", "stats", "--days", "7", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"window_days\": 7"));
}

#[test]
fn test_executions_show_unknown_fails() {
    let dir = TempDir::new().unwrap();
    jobwarden(&dir)
        .args(["executions", "show", "manual_execution_20250101_000000_00000000"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not found"));
}

#[test]
fn test_explicit_config_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        "[storage]\ndb_path = \"ledger.db\"\n\n[[tasks]]\ntask_id = \"only-one\"\ntask_type = \"training\"\nsubjects = [\"BTC\"]\nfrequency = \"daily\"\n",
    )
    .unwrap();
    jobwarden(&dir)
        .arg("--config")
        .arg(&path)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("only-one"))
        .stdout(predicates::str::contains("backtest-majors-4h").not());
    assert!(!dir.path().join("jobwarden.toml").exists());
}
