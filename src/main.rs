use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use proctor::config::CoordinatorConfig;
use proctor::export::ResultExporter;
use proctor::model::{
    ImportOptions, LogLevel, RefreshType, RequestStatus, TestPlatform, TestRequestType,
};
use proctor::storage::{ConsoleLogQuery, Store};

#[derive(Parser)]
#[command(
    name = "proctor",
    about = "Test-run coordination for single-threaded host applications",
    version,
    long_about = None
)]
struct Cli {
    /// Coordination database path (overrides configuration)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the coordination database and schema
    InitDb,

    /// Submit and inspect test requests
    Test {
        #[command(subcommand)]
        action: TestAction,
    },

    /// Submit and inspect asset refresh requests
    Refresh {
        #[command(subcommand)]
        action: RefreshAction,
    },

    /// Read captured logs
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },

    /// Render result artifacts for a finished request
    Export {
        /// Test request id
        #[arg(long)]
        id: i64,

        /// Output directory
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },

    /// Prune old console and execution logs
    Prune {
        /// Delete log rows older than this many days
        #[arg(long, default_value = "7")]
        days: u32,
    },
}

#[derive(Subcommand)]
enum TestAction {
    /// Enqueue a test run
    Run {
        /// Request type: all, class, method, category
        #[arg(long = "type", default_value = "all")]
        request_type: String,

        /// Platform: editor, runtime, both
        #[arg(long, default_value = "editor")]
        platform: String,

        /// Filter string (class name, method name, or categories)
        #[arg(long)]
        filter: Option<String>,

        /// Higher priority runs first
        #[arg(long, default_value = "0")]
        priority: i64,

        /// Block until the request reaches a terminal status
        #[arg(long)]
        wait: bool,

        /// Timeout in seconds when waiting
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Show the status of a test request
    Status {
        #[arg(long)]
        id: i64,
    },

    /// Cancel a pending or running test request
    Cancel {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum RefreshAction {
    /// Enqueue an asset refresh
    Run {
        /// Refresh type: full, selective
        #[arg(long = "type", default_value = "full")]
        refresh_type: String,

        /// Paths for a selective refresh (repeatable)
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Import options: default, synchronous, force_update
        #[arg(long, default_value = "default")]
        options: String,

        /// Higher priority runs first
        #[arg(long, default_value = "0")]
        priority: i64,

        /// Block until the request reaches a terminal status
        #[arg(long)]
        wait: bool,

        /// Timeout in seconds when waiting
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Show the status of a refresh request
    Status {
        #[arg(long)]
        id: i64,
    },

    /// Cancel a pending or running refresh request
    Cancel {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// Captured console logs
    Console {
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Filter by level: Info, Warning, Error, Exception, Assert
        #[arg(long)]
        level: Option<String>,

        /// Only logs captured during this request
        #[arg(long)]
        request: Option<i64>,

        /// Only logs from the last N minutes
        #[arg(long)]
        minutes: Option<i64>,
    },

    /// Execution log breadcrumbs
    Execution {
        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long)]
        request: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = CoordinatorConfig::load_or_default();
    let db_path = cli.db.unwrap_or_else(|| config.storage.db_path.clone());

    match cli.command {
        Commands::InitDb => {
            let _store = Store::open(&db_path)?;
            println!("Database ready at: {}", db_path.display());
        }
        Commands::Test { action } => {
            let store = Store::open(&db_path)?;
            run_test_action(&store, action).await?;
        }
        Commands::Refresh { action } => {
            let store = Store::open(&db_path)?;
            run_refresh_action(&store, action).await?;
        }
        Commands::Logs { action } => {
            let store = Store::open(&db_path)?;
            run_logs_action(&store, action)?;
        }
        Commands::Export { id, out } => {
            let store = Store::open(&db_path)?;
            let Some(request) = store.get_test(id)? else {
                bail!("test request {} not found", id);
            };
            if !request.status.is_terminal() {
                bail!("test request {} has not finished ({})", id, request.status);
            }
            let cases = store.case_results(id)?;
            let exporter = ResultExporter::new(out);
            exporter.write_run(&request, &request.tally, request.duration_seconds, &cases)?;
            println!("XML:     {}", exporter.xml_path(id).display());
            println!("Summary: {}", exporter.summary_path(id).display());
        }
        Commands::Prune { days } => {
            let store = Store::open(&db_path)?;
            let (console, execution) = store.prune_logs(days)?;
            println!(
                "Pruned {} console and {} execution log rows older than {} days.",
                console, execution, days
            );
        }
    }

    Ok(())
}

async fn run_test_action(store: &Store, action: TestAction) -> Result<()> {
    match action {
        TestAction::Run {
            request_type,
            platform,
            filter,
            priority,
            wait,
            timeout,
        } => {
            let Some(request_type) = TestRequestType::parse(&request_type) else {
                bail!("invalid request type '{}' (expected all, class, method or category)", request_type);
            };
            let Some(platform) = TestPlatform::parse(&platform) else {
                bail!("invalid platform '{}' (expected editor, runtime or both)", platform);
            };
            if matches!(
                request_type,
                TestRequestType::Class | TestRequestType::Method | TestRequestType::Category
            ) && filter.is_none()
            {
                bail!("--filter is required for {} requests", request_type);
            }

            let id = store.enqueue_test(request_type, platform, filter.as_deref(), priority)?;
            store.append_execution_log(
                Some(id),
                proctor::model::ExecLogLevel::Info,
                "driver",
                &format!("test request submitted: {} on {}", request_type, platform),
            )?;
            println!("Submitted test request #{}", id);
            println!("  Type: {}", request_type);
            println!("  Platform: {}", platform);
            if let Some(filter) = &filter {
                println!("  Filter: {}", filter);
            }

            if wait {
                wait_for_test(store, id, Duration::from_secs(timeout)).await?;
                print_test_summary(store, id)?;
            }
        }
        TestAction::Status { id } => {
            print_test_summary(store, id)?;
        }
        TestAction::Cancel { id } => {
            if store.cancel_test(id)? {
                println!("Cancelled test request #{}", id);
            } else {
                println!("Test request #{} cannot be cancelled (not pending/running)", id);
            }
        }
    }
    Ok(())
}

async fn run_refresh_action(store: &Store, action: RefreshAction) -> Result<()> {
    match action {
        RefreshAction::Run {
            refresh_type,
            paths,
            options,
            priority,
            wait,
            timeout,
        } => {
            let Some(refresh_type) = RefreshType::parse(&refresh_type) else {
                bail!("invalid refresh type '{}' (expected full or selective)", refresh_type);
            };
            let Some(options) = ImportOptions::parse(&options) else {
                bail!(
                    "invalid import options '{}' (expected default, synchronous or force_update)",
                    options
                );
            };

            let paths_arg = if paths.is_empty() { None } else { Some(&paths[..]) };
            let id = store.enqueue_refresh(refresh_type, paths_arg, options, priority)?;
            println!("Submitted refresh request #{}", id);
            println!("  Type: {}", refresh_type.as_str());
            if !paths.is_empty() {
                println!("  Paths: {}", paths.join(", "));
            }
            println!("  Options: {}", options.as_str());

            if wait {
                wait_for_refresh(store, id, Duration::from_secs(timeout)).await?;
                print_refresh_summary(store, id)?;
            }
        }
        RefreshAction::Status { id } => {
            print_refresh_summary(store, id)?;
        }
        RefreshAction::Cancel { id } => {
            if store.cancel_refresh(id)? {
                println!("Cancelled refresh request #{}", id);
            } else {
                println!(
                    "Refresh request #{} cannot be cancelled (not pending/running)",
                    id
                );
            }
        }
    }
    Ok(())
}

fn run_logs_action(store: &Store, action: LogsAction) -> Result<()> {
    match action {
        LogsAction::Console {
            limit,
            level,
            request,
            minutes,
        } => {
            let level = match level.as_deref() {
                Some(raw) => match LogLevel::parse(raw) {
                    Some(level) => Some(level),
                    None => bail!(
                        "invalid log level '{}' (expected Info, Warning, Error, Exception or Assert)",
                        raw
                    ),
                },
                None => None,
            };
            let entries = store.console_logs(&ConsoleLogQuery {
                limit,
                level,
                request_id: request,
                session_id: None,
                since_minutes: minutes,
            })?;
            if entries.is_empty() {
                println!("No console logs found.");
                return Ok(());
            }
            // Newest first from the store; print oldest first for reading.
            for entry in entries.iter().rev() {
                println!(
                    "[{}] [{:9}] {}",
                    entry.timestamp.format("%H:%M:%S%.3f"),
                    entry.log_level.as_str(),
                    entry.message
                );
                if let Some(stack) = &entry.truncated_stack {
                    for line in stack.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
        LogsAction::Execution { limit, request } => {
            let entries = store.execution_logs(request, limit)?;
            if entries.is_empty() {
                println!("No execution logs found.");
                return Ok(());
            }
            for entry in entries.iter().rev() {
                let request_tag = entry
                    .request_id
                    .map(|id| format!("#{}", id))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "[{}] [{:7}] [{:>5}] {} ({})",
                    entry.created_at.format("%H:%M:%S"),
                    entry.log_level,
                    request_tag,
                    entry.message,
                    entry.source.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
    Ok(())
}

async fn wait_for_test(store: &Store, id: i64, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut last_status: Option<RequestStatus> = None;
    loop {
        let Some(request) = store.get_test(id)? else {
            bail!("test request {} not found", id);
        };
        if last_status != Some(request.status) {
            println!("[STATUS] {}", request.status);
            last_status = Some(request.status);
        }
        if request.status.is_terminal() {
            return Ok(());
        }
        if started.elapsed() > timeout {
            bail!(
                "test request {} did not complete within {} seconds",
                id,
                timeout.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn wait_for_refresh(store: &Store, id: i64, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut last_status: Option<RequestStatus> = None;
    loop {
        let Some(request) = store.get_refresh(id)? else {
            bail!("refresh request {} not found", id);
        };
        if last_status != Some(request.status) {
            println!("[STATUS] {}", request.status);
            last_status = Some(request.status);
        }
        if request.status.is_terminal() {
            return Ok(());
        }
        if started.elapsed() > timeout {
            bail!(
                "refresh request {} did not complete within {} seconds",
                id,
                timeout.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn print_test_summary(store: &Store, id: i64) -> Result<()> {
    let Some(request) = store.get_test(id)? else {
        bail!("test request {} not found", id);
    };

    println!("{}", "=".repeat(60));
    println!("Test Request #{} Summary", id);
    println!("{}", "=".repeat(60));
    println!("Status: {}", request.status);
    println!("Type: {}", request.request_type);
    println!("Platform: {}", request.test_platform);
    if let Some(filter) = &request.test_filter {
        println!("Filter: {}", filter);
    }

    match request.status {
        RequestStatus::Completed => {
            println!();
            println!("Results:");
            println!("  Total: {}", request.tally.total);
            println!("  Passed: {}", request.tally.passed);
            println!("  Failed: {}", request.tally.failed);
            println!("  Skipped: {}", request.tally.skipped);
            println!("  Duration: {:.2} seconds", request.duration_seconds);

            if request.tally.failed > 0 {
                let cases = store.case_results(id)?;
                println!();
                println!("Failed Tests:");
                for case in cases
                    .iter()
                    .filter(|c| c.result == proctor::model::CaseStatus::Failed)
                {
                    println!("  [FAILED] {}", case.test_name);
                    if let Some(message) = &case.error_message {
                        if let Some(first_line) = message.lines().next() {
                            println!("     {}", first_line);
                        }
                    }
                }
            }
        }
        RequestStatus::Failed => {
            println!();
            println!(
                "[ERROR] {}",
                request.error_message.as_deref().unwrap_or("unknown failure")
            );
        }
        _ => {}
    }
    println!("{}", "=".repeat(60));
    Ok(())
}

fn print_refresh_summary(store: &Store, id: i64) -> Result<()> {
    let Some(request) = store.get_refresh(id)? else {
        bail!("refresh request {} not found", id);
    };

    println!("{}", "=".repeat(60));
    println!("Refresh Request #{} Summary", id);
    println!("{}", "=".repeat(60));
    println!("Type: {}", request.refresh_type);
    println!("Status: {}", request.status);
    println!("Options: {}", request.import_options);
    if let Some(paths) = &request.paths {
        println!("Paths: {}", paths);
    }
    if request.duration_seconds > 0.0 {
        println!("Duration: {:.2} seconds", request.duration_seconds);
    }
    if let Some(message) = &request.result_message {
        println!("Result: {}", message);
    }
    if let Some(error) = &request.error_message {
        println!("Error: {}", error);
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
