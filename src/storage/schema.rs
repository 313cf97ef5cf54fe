//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS executions (
            execution_id TEXT PRIMARY KEY,
            execution_type TEXT NOT NULL,
            subject_json TEXT NOT NULL,
            status TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            current_operation TEXT,
            progress_percentage REAL NOT NULL DEFAULT 0,
            total_steps INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_seconds REAL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_subjects (
            execution_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            subject TEXT NOT NULL,
            PRIMARY KEY (execution_id, position),
            FOREIGN KEY (execution_id) REFERENCES executions(execution_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS execution_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            duration_seconds REAL,
            result_json TEXT,
            error_message TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (execution_id) REFERENCES executions(execution_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS execution_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (execution_id) REFERENCES executions(execution_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            task_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_executed_at TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_execution_subjects_subject ON execution_subjects(subject);
        CREATE INDEX IF NOT EXISTS idx_execution_steps_execution ON execution_steps(execution_id);
        CREATE INDEX IF NOT EXISTS idx_execution_errors_execution ON execution_errors(execution_id);",
    )?;

    // Migration: resource stats reported by workers
    let has_peak_cpu: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('executions') WHERE name='peak_cpu_percent'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_peak_cpu == 0 {
        conn.execute_batch(
            "ALTER TABLE executions ADD COLUMN peak_cpu_percent REAL;
             ALTER TABLE executions ADD COLUMN peak_memory_mb REAL;",
        )?;
    }

    // Migration: dispatch attempts, failed ones included
    let has_attempted: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('scheduled_tasks') WHERE name='last_attempted_at'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_attempted == 0 {
        conn.execute_batch("ALTER TABLE scheduled_tasks ADD COLUMN last_attempted_at TEXT;")?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Current schema revision recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 3;
