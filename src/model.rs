//! Row types and string enums shared between the store, dispatcher and CLI.
//!
//! Everything here round-trips through SQLite as TEXT, so each enum carries
//! an `as_str`/`parse` pair matching the CHECK constraints in the schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by test and refresh requests.
///
/// Transitions are monotonic: pending -> running -> {completed, failed,
/// cancelled}. The store enforces this with guarded UPDATEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "running" => Some(RequestStatus::Running),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses the driver polls for.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a test request selects: everything, a class, a method, or a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestRequestType {
    All,
    Class,
    Method,
    Category,
}

impl TestRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestRequestType::All => "all",
            TestRequestType::Class => "class",
            TestRequestType::Method => "method",
            TestRequestType::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(TestRequestType::All),
            "class" => Some(TestRequestType::Class),
            "method" => Some(TestRequestType::Method),
            "category" => Some(TestRequestType::Category),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Host execution context. `Both` means editor then runtime, sequentially --
/// the host only supports one active context at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestPlatform {
    Editor,
    Runtime,
    Both,
}

impl TestPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPlatform::Editor => "editor",
            TestPlatform::Runtime => "runtime",
            TestPlatform::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "editor" => Some(TestPlatform::Editor),
            "runtime" => Some(TestPlatform::Runtime),
            "both" => Some(TestPlatform::Both),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-case verdict reported by the host runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Inconclusive,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Passed => "Passed",
            CaseStatus::Failed => "Failed",
            CaseStatus::Skipped => "Skipped",
            CaseStatus::Inconclusive => "Inconclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Passed" => Some(CaseStatus::Passed),
            "Failed" => Some(CaseStatus::Failed),
            "Skipped" => Some(CaseStatus::Skipped),
            "Inconclusive" => Some(CaseStatus::Inconclusive),
            _ => None,
        }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Console log severity as reported by the host's log hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Exception,
    Assert,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Exception => "Exception",
            LogLevel::Assert => "Assert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Info" => Some(LogLevel::Info),
            "Warning" => Some(LogLevel::Warning),
            "Error" => Some(LogLevel::Error),
            "Exception" => Some(LogLevel::Exception),
            "Assert" => Some(LogLevel::Assert),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity for execution-log breadcrumbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecLogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecLogLevel::Debug => "DEBUG",
            ExecLogLevel::Info => "INFO",
            ExecLogLevel::Warning => "WARNING",
            ExecLogLevel::Error => "ERROR",
        }
    }
}

/// Asset refresh scope selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshType {
    Full,
    Selective,
}

impl RefreshType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshType::Full => "full",
            RefreshType::Selective => "selective",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RefreshType::Full),
            "selective" => Some(RefreshType::Selective),
            _ => None,
        }
    }
}

/// Import behavior requested for a refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOptions {
    Default,
    Synchronous,
    ForceUpdate,
}

impl ImportOptions {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportOptions::Default => "default",
            ImportOptions::Synchronous => "synchronous",
            ImportOptions::ForceUpdate => "force_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(ImportOptions::Default),
            "synchronous" => Some(ImportOptions::Synchronous),
            "force_update" => Some(ImportOptions::ForceUpdate),
            _ => None,
        }
    }
}

/// Aggregate pass/fail counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTally {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl TestTally {
    pub fn record(&mut self, status: CaseStatus) {
        self.total += 1;
        match status {
            CaseStatus::Passed => self.passed += 1,
            CaseStatus::Failed => self.failed += 1,
            CaseStatus::Skipped => self.skipped += 1,
            // Inconclusive counts toward the total only.
            CaseStatus::Inconclusive => {}
        }
    }

    pub fn merge(&mut self, other: &TestTally) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// One persisted test request row.
///
/// `request_type` and `test_platform` are kept as raw strings here; the
/// executor parses them leniently so a row written by an older driver falls
/// back to documented defaults instead of failing the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub id: i64,
    pub request_type: String,
    pub test_filter: Option<String>,
    pub test_platform: String,
    pub status: RequestStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub tally: TestTally,
    pub duration_seconds: f64,
}

/// One persisted asset refresh request row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub id: i64,
    pub refresh_type: String,
    /// JSON array of path strings, present iff selective.
    pub paths: Option<String>,
    pub import_options: String,
    pub status: RequestStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub result_message: Option<String>,
    pub error_message: Option<String>,
}

/// One captured console log line, truncation already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLogEntry {
    pub session_id: String,
    pub log_level: LogLevel,
    pub message: String,
    pub stack_trace: Option<String>,
    pub truncated_stack: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub frame_count: i64,
    pub is_truncated: bool,
    pub request_id: Option<i64>,
}

/// One execution-log breadcrumb. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub request_id: Option<i64>,
    pub log_level: String,
    pub source: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One per-case result row, persisted on run completion and read back by the
/// exporter and the driver's failure listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub test_name: String,
    pub test_class: Option<String>,
    pub result: CaseStatus,
    pub duration_ms: f64,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl CaseResult {
    /// Suite name used when grouping cases in the export tree: the explicit
    /// class if the host supplied one, else the dotted prefix of the name.
    pub fn suite_name(&self) -> String {
        if let Some(class) = &self.test_class {
            if !class.is_empty() {
                return class.clone();
            }
        }
        match self.test_name.rsplit_once('.') {
            Some((prefix, _)) => prefix.to_string(),
            None => "(root)".to_string(),
        }
    }
}
