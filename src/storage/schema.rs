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

        CREATE TABLE IF NOT EXISTS test_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_type TEXT NOT NULL CHECK(request_type IN ('all', 'class', 'method', 'category')),
            test_filter TEXT,
            test_platform TEXT NOT NULL CHECK(test_platform IN ('editor', 'runtime', 'both')),
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            completed_at TEXT,
            result_summary TEXT,
            error_message TEXT,
            total_tests INTEGER NOT NULL DEFAULT 0,
            passed_tests INTEGER NOT NULL DEFAULT 0,
            failed_tests INTEGER NOT NULL DEFAULT 0,
            skipped_tests INTEGER NOT NULL DEFAULT 0,
            duration_seconds REAL NOT NULL DEFAULT 0.0
        );

        CREATE TABLE IF NOT EXISTS refresh_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            refresh_type TEXT NOT NULL DEFAULT 'full' CHECK(refresh_type IN ('full', 'selective')),
            paths TEXT,
            import_options TEXT NOT NULL DEFAULT 'default' CHECK(import_options IN ('default', 'synchronous', 'force_update')),
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            completed_at TEXT,
            duration_seconds REAL NOT NULL DEFAULT 0.0,
            result_message TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS case_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER NOT NULL,
            test_name TEXT NOT NULL,
            test_class TEXT,
            result TEXT NOT NULL CHECK(result IN ('Passed', 'Failed', 'Skipped', 'Inconclusive')),
            duration_ms REAL NOT NULL DEFAULT 0.0,
            error_message TEXT,
            stack_trace TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (request_id) REFERENCES test_requests(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS execution_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER,
            log_level TEXT NOT NULL CHECK(log_level IN ('DEBUG', 'INFO', 'WARNING', 'ERROR')),
            source TEXT,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS console_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            log_level TEXT NOT NULL CHECK(log_level IN ('Info', 'Warning', 'Error', 'Exception', 'Assert')),
            message TEXT NOT NULL,
            stack_trace TEXT,
            truncated_stack TEXT,
            source_file TEXT,
            source_line INTEGER,
            timestamp TEXT NOT NULL DEFAULT (datetime('now')),
            frame_count INTEGER NOT NULL DEFAULT 0,
            is_truncated INTEGER NOT NULL DEFAULT 0,
            request_id INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_test_requests_status ON test_requests(status);
        CREATE INDEX IF NOT EXISTS idx_test_requests_created ON test_requests(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_refresh_requests_status ON refresh_requests(status);
        CREATE INDEX IF NOT EXISTS idx_refresh_requests_created ON refresh_requests(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_case_results_request ON case_results(request_id);
        CREATE INDEX IF NOT EXISTS idx_execution_logs_request ON execution_logs(request_id);
        CREATE INDEX IF NOT EXISTS idx_console_logs_session ON console_logs(session_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_console_logs_level ON console_logs(log_level, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_console_logs_request ON console_logs(request_id, timestamp DESC);",
    )?;

    Ok(())
}
