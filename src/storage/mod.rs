//! SQLite storage layer -- schema, queries, migrations.
//!
//! The store is the only component touching durable state. Everything else
//! holds a read-refreshed copy at most; after a restart the store is the
//! single source of truth.

pub mod schema;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::error::CoordinationError;
use crate::model::{
    CaseResult, CaseStatus, ConsoleLogEntry, ExecLogLevel, ExecutionLogEntry, ImportOptions,
    LogLevel, RefreshRequest, RefreshType, RequestStatus, TestPlatform, TestRequest,
    TestRequestType, TestTally,
};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the coordination database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Filters for console log retrieval.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLogQuery {
    pub limit: usize,
    pub level: Option<LogLevel>,
    pub request_id: Option<i64>,
    pub session_id: Option<String>,
    pub since_minutes: Option<i64>,
}

/// Typed access to the coordination database.
///
/// Cheap to clone; all clones share the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open a store at `path`, creating the database if needed.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()).into())
    }

    // ---- test requests ----------------------------------------------------

    pub fn enqueue_test(
        &self,
        request_type: TestRequestType,
        platform: TestPlatform,
        filter: Option<&str>,
        priority: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO test_requests (request_type, test_filter, test_platform, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request_type.as_str(),
                filter,
                platform.as_str(),
                priority,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest pending test request, highest priority first.
    pub fn next_pending_test(&self) -> Result<Option<TestRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_type, test_filter, test_platform, status, priority,
                    created_at, started_at, completed_at, result_summary, error_message,
                    total_tests, passed_tests, failed_tests, skipped_tests, duration_seconds
             FROM test_requests
             WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], map_test_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn has_pending_test(&self) -> Result<bool> {
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM test_requests WHERE status = 'pending')",
            [],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// Atomic pending -> running transition. Returns false if the row was no
    /// longer pending (cancelled, or claimed elsewhere).
    pub fn mark_test_running(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE test_requests
             SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Final status, counts and duration in a single update, guarded so a
    /// cancelled row is never overwritten. Returns false if the row was not
    /// `running` anymore.
    pub fn finish_test(
        &self,
        id: i64,
        status: RequestStatus,
        tally: &TestTally,
        duration_seconds: f64,
        result_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE test_requests
             SET status = ?2, completed_at = ?3, result_summary = ?4, error_message = ?5,
                 total_tests = ?6, passed_tests = ?7, failed_tests = ?8, skipped_tests = ?9,
                 duration_seconds = ?10
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                status.as_str(),
                Utc::now().to_rfc3339(),
                result_summary,
                error_message,
                tally.total,
                tally.passed,
                tally.failed,
                tally.skipped,
                duration_seconds
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn cancel_test(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE test_requests
             SET status = 'cancelled', completed_at = ?2, error_message = 'Cancelled by driver'
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_test(&self, id: i64) -> Result<Option<TestRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_type, test_filter, test_platform, status, priority,
                    created_at, started_at, completed_at, result_summary, error_message,
                    total_tests, passed_tests, failed_tests, skipped_tests, duration_seconds
             FROM test_requests WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_test_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All rows currently marked running. More than one is already a broken
    /// invariant; recovery resolves them individually.
    pub fn running_tests(&self) -> Result<Vec<TestRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_type, test_filter, test_platform, status, priority,
                    created_at, started_at, completed_at, result_summary, error_message,
                    total_tests, passed_tests, failed_tests, skipped_tests, duration_seconds
             FROM test_requests WHERE status = 'running' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_test_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- refresh requests -------------------------------------------------

    pub fn enqueue_refresh(
        &self,
        refresh_type: RefreshType,
        paths: Option<&[String]>,
        options: ImportOptions,
        priority: i64,
    ) -> Result<i64> {
        let paths_json = match paths {
            Some(p) if !p.is_empty() => Some(serde_json::to_string(p)?),
            _ => None,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO refresh_requests (refresh_type, paths, import_options, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                refresh_type.as_str(),
                paths_json,
                options.as_str(),
                priority,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn next_pending_refresh(&self) -> Result<Option<RefreshRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, refresh_type, paths, import_options, status, priority,
                    created_at, started_at, completed_at, duration_seconds,
                    result_message, error_message
             FROM refresh_requests
             WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], map_refresh_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn has_pending_refresh(&self) -> Result<bool> {
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM refresh_requests WHERE status = 'pending')",
            [],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn mark_refresh_running(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE refresh_requests
             SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn finish_refresh(
        &self,
        id: i64,
        status: RequestStatus,
        duration_seconds: f64,
        result_message: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE refresh_requests
             SET status = ?2, completed_at = ?3, duration_seconds = ?4,
                 result_message = ?5, error_message = ?6
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                status.as_str(),
                Utc::now().to_rfc3339(),
                duration_seconds,
                result_message,
                error_message
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn cancel_refresh(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE refresh_requests
             SET status = 'cancelled', completed_at = ?2, error_message = 'Cancelled by driver'
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_refresh(&self, id: i64) -> Result<Option<RefreshRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, refresh_type, paths, import_options, status, priority,
                    created_at, started_at, completed_at, duration_seconds,
                    result_message, error_message
             FROM refresh_requests WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_refresh_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn running_refreshes(&self) -> Result<Vec<RefreshRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, refresh_type, paths, import_options, status, priority,
                    created_at, started_at, completed_at, duration_seconds,
                    result_message, error_message
             FROM refresh_requests WHERE status = 'running' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_refresh_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- case results -----------------------------------------------------

    /// Persist per-case results for a finished run in one transaction.
    pub fn insert_case_results(&self, request_id: i64, cases: &[CaseResult]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO case_results
                 (request_id, test_name, test_class, result, duration_ms, error_message, stack_trace, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let now = Utc::now().to_rfc3339();
            for case in cases {
                stmt.execute(params![
                    request_id,
                    case.test_name,
                    case.test_class,
                    case.result.as_str(),
                    case.duration_ms,
                    case.error_message,
                    case.stack_trace,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(cases.len())
    }

    pub fn case_results(&self, request_id: i64) -> Result<Vec<CaseResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT test_name, test_class, result, duration_ms, error_message, stack_trace
             FROM case_results WHERE request_id = ?1 ORDER BY test_name ASC",
        )?;
        let rows = stmt.query_map(params![request_id], |row| {
            let result_str: String = row.get(2)?;
            Ok(CaseResult {
                test_name: row.get(0)?,
                test_class: row.get(1)?,
                result: CaseStatus::parse(&result_str).unwrap_or(CaseStatus::Inconclusive),
                duration_ms: row.get(3)?,
                error_message: row.get(4)?,
                stack_trace: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- execution log ----------------------------------------------------

    pub fn append_execution_log(
        &self,
        request_id: Option<i64>,
        level: ExecLogLevel,
        source: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO execution_logs (request_id, log_level, source, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request_id,
                level.as_str(),
                source,
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn execution_logs(
        &self,
        request_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ExecutionLogEntry>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ExecutionLogEntry> {
            let created: String = row.get(5)?;
            Ok(ExecutionLogEntry {
                id: row.get(0)?,
                request_id: row.get(1)?,
                log_level: row.get(2)?,
                source: row.get(3)?,
                message: row.get(4)?,
                created_at: parse_timestamp(&created),
            })
        };
        if let Some(id) = request_id {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, log_level, source, message, created_at
                 FROM execution_logs WHERE request_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            for r in stmt.query_map(params![id, limit as i64], map)? {
                out.push(r?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, log_level, source, message, created_at
                 FROM execution_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
            )?;
            for r in stmt.query_map(params![limit as i64], map)? {
                out.push(r?);
            }
        }
        Ok(out)
    }

    // ---- console logs -----------------------------------------------------

    /// Batch-insert drained console entries in one transaction. This is the
    /// slow path; producers only ever touch the in-memory queue.
    pub fn insert_console_batch(&self, entries: &[ConsoleLogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO console_logs
                 (session_id, log_level, message, stack_trace, truncated_stack,
                  source_file, source_line, timestamp, frame_count, is_truncated, request_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.session_id,
                    entry.log_level.as_str(),
                    entry.message,
                    entry.stack_trace,
                    entry.truncated_stack,
                    entry.source_file,
                    entry.source_line,
                    entry.timestamp.to_rfc3339(),
                    entry.frame_count,
                    entry.is_truncated as i64,
                    entry.request_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    pub fn console_logs(&self, query: &ConsoleLogQuery) -> Result<Vec<ConsoleLogEntry>> {
        let conn = self.conn()?;

        let mut sql = String::from(
            "SELECT session_id, log_level, message, stack_trace, truncated_stack,
                    source_file, source_line, timestamp, frame_count, is_truncated, request_id
             FROM console_logs WHERE 1=1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(session) = &query.session_id {
            sql.push_str(&format!(" AND session_id = ?{}", binds.len() + 1));
            binds.push(Box::new(session.clone()));
        }
        if let Some(level) = query.level {
            sql.push_str(&format!(" AND log_level = ?{}", binds.len() + 1));
            binds.push(Box::new(level.as_str().to_string()));
        }
        if let Some(request_id) = query.request_id {
            sql.push_str(&format!(" AND request_id = ?{}", binds.len() + 1));
            binds.push(Box::new(request_id));
        }
        if let Some(minutes) = query.since_minutes {
            let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
            sql.push_str(&format!(" AND timestamp > ?{}", binds.len() + 1));
            binds.push(Box::new(cutoff.to_rfc3339()));
        }
        let limit = if query.limit == 0 { 50 } else { query.limit };
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
            binds.len() + 1
        ));
        binds.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            let level_str: String = row.get(1)?;
            let ts: String = row.get(7)?;
            Ok(ConsoleLogEntry {
                session_id: row.get(0)?,
                log_level: LogLevel::parse(&level_str).unwrap_or(LogLevel::Info),
                message: row.get(2)?,
                stack_trace: row.get(3)?,
                truncated_stack: row.get(4)?,
                source_file: row.get(5)?,
                source_line: row.get(6)?,
                timestamp: parse_timestamp(&ts),
                frame_count: row.get(8)?,
                is_truncated: row.get::<_, i64>(9)? != 0,
                request_id: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- retention --------------------------------------------------------

    /// Prune console and execution logs older than `retention_days`.
    /// Returns (console_deleted, execution_deleted).
    pub fn prune_logs(&self, retention_days: u32) -> Result<(usize, usize)> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        let conn = self.conn()?;
        let console = conn.execute(
            "DELETE FROM console_logs WHERE timestamp < ?1",
            params![cutoff],
        )?;
        let execution = conn.execute(
            "DELETE FROM execution_logs WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok((console, execution))
    }
}

fn map_test_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestRequest> {
    let status_str: String = row.get(4)?;
    let created: String = row.get(6)?;
    let started: Option<String> = row.get(7)?;
    let completed: Option<String> = row.get(8)?;
    Ok(TestRequest {
        id: row.get(0)?,
        request_type: row.get(1)?,
        test_filter: row.get(2)?,
        test_platform: row.get(3)?,
        status: RequestStatus::parse(&status_str).unwrap_or(RequestStatus::Pending),
        priority: row.get(5)?,
        created_at: parse_timestamp(&created),
        started_at: started.as_deref().map(parse_timestamp),
        completed_at: completed.as_deref().map(parse_timestamp),
        result_summary: row.get(9)?,
        error_message: row.get(10)?,
        tally: TestTally {
            total: row.get(11)?,
            passed: row.get(12)?,
            failed: row.get(13)?,
            skipped: row.get(14)?,
        },
        duration_seconds: row.get(15)?,
    })
}

fn map_refresh_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefreshRequest> {
    let status_str: String = row.get(4)?;
    let created: String = row.get(6)?;
    let started: Option<String> = row.get(7)?;
    let completed: Option<String> = row.get(8)?;
    Ok(RefreshRequest {
        id: row.get(0)?,
        refresh_type: row.get(1)?,
        paths: row.get(2)?,
        import_options: row.get(3)?,
        status: RequestStatus::parse(&status_str).unwrap_or(RequestStatus::Pending),
        priority: row.get(5)?,
        created_at: parse_timestamp(&created),
        started_at: started.as_deref().map(parse_timestamp),
        completed_at: completed.as_deref().map(parse_timestamp),
        duration_seconds: row.get(9)?,
        result_message: row.get(10)?,
        error_message: row.get(11)?,
    })
}

/// Lenient timestamp parse: RFC3339 first, then the bare `datetime('now')`
/// format a foreign driver may have written.
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return DateTime::from_naive_utc_and_offset(naive, Utc);
    }
    Default::default()
}
