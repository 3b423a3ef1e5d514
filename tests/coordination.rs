//! End-to-end coordination tests: driver enqueues rows, the poller discovers
//! them, the dispatch loop executes against scripted hosts, and the store
//! carries the observable outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use proctor::capture::LogEvent;
use proctor::config::CoordinatorConfig;
use proctor::export::ResultExporter;
use proctor::host::{
    AssetImporter, HostScheduler, ImportOutcome, ImportScope, RunEvent, TestRunner,
};
use proctor::model::{
    CaseStatus, ImportOptions, LogLevel, RefreshType, RequestStatus, TestPlatform,
    TestRequestType,
};
use proctor::runner::filter::RunFilter;
use proctor::storage::{ConsoleLogQuery, Store};
use proctor::{Coordinator, Hosts};

/// Runner that replays a scripted case list, tracking concurrent invocations.
struct ScriptedRunner {
    cases: Vec<(String, CaseStatus)>,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl ScriptedRunner {
    fn new(cases: Vec<(&str, CaseStatus)>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            cases: cases
                .into_iter()
                .map(|(n, s)| (n.to_string(), s))
                .collect(),
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run(
        &self,
        filter: RunFilter,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> Result<()> {
        let active = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);

        let _ = events.send(RunEvent::RunStarted);
        tokio::time::sleep(self.delay).await;

        // Category filters with no scripted match select nothing.
        let selected: Vec<_> = if filter.categories.is_empty() {
            self.cases.iter().collect()
        } else {
            Vec::new()
        };
        for (name, status) in selected {
            let _ = events.send(RunEvent::TestStarted { name: name.clone() });
            let _ = events.send(RunEvent::TestFinished {
                name: name.clone(),
                status: *status,
                duration_ms: 1.0,
                message: match status {
                    CaseStatus::Failed => Some("assertion failed".to_string()),
                    _ => None,
                },
                stack_trace: None,
            });
        }
        let _ = events.send(RunEvent::RunFinished);

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Importer that records requested scopes and replays a fixed outcome.
struct RecordingImporter {
    outcome: ImportOutcome,
    scopes: Mutex<Vec<ImportScope>>,
}

impl RecordingImporter {
    fn new(outcome: ImportOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            scopes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AssetImporter for RecordingImporter {
    async fn import(&self, scope: ImportScope, _options: ImportOptions) -> Result<ImportOutcome> {
        self.scopes.lock().unwrap().push(scope);
        Ok(self.outcome)
    }
}

struct CountingScheduler {
    ticks: AtomicUsize,
}

impl HostScheduler for CountingScheduler {
    fn request_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config(dir: &TempDir) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.storage.db_path = dir.path().join("coordination.db");
    config.export.results_dir = dir.path().join("results");
    config.poller.interval_ms = 20;
    config.capture.drain_interval_ms = 20;
    config
}

fn hosts(runner: Arc<ScriptedRunner>, importer: Arc<RecordingImporter>) -> Hosts {
    Hosts {
        runner,
        importer,
        scheduler: None,
    }
}

async fn wait_until<F>(mut predicate: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_terminal(store: &Store, id: i64) -> RequestStatus {
    let store = store.clone();
    wait_until(
        || {
            store
                .get_test(id)
                .unwrap()
                .map(|r| r.status.is_terminal())
                .unwrap_or(false)
        },
        "test request to finish",
    )
    .await;
    store.get_test(id).unwrap().unwrap().status
}

#[tokio::test]
async fn test_full_run_with_case_failures_still_completes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let mut cases: Vec<(String, CaseStatus)> = Vec::new();
    for i in 0..10 {
        cases.push((format!("Game.SmokeTests.test_{}", i), CaseStatus::Passed));
    }
    cases.push(("Game.SmokeTests.test_x".to_string(), CaseStatus::Failed));
    cases.push(("Game.SmokeTests.test_y".to_string(), CaseStatus::Failed));
    let runner = ScriptedRunner::new(
        cases.iter().map(|(n, s)| (n.as_str(), *s)).collect(),
        Duration::from_millis(10),
    );
    let importer = RecordingImporter::new(ImportOutcome::Completed);

    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();

    let status = wait_terminal(&store, id).await;
    // Individual case failures do not fail the request; `failed` is reserved
    // for infrastructure faults.
    assert_eq!(status, RequestStatus::Completed);

    let request = store.get_test(id).unwrap().unwrap();
    assert_eq!(request.tally.total, 12);
    assert_eq!(request.tally.passed, 10);
    assert_eq!(request.tally.failed, 2);
    assert!(request.duration_seconds > 0.0);
    assert!(request.result_summary.unwrap().contains("12 total"));

    // Artifacts were written before the final status flip.
    let exporter = ResultExporter::new(config.export.results_dir.clone());
    assert!(exporter.xml_path(id).exists());
    assert!(exporter.summary_path(id).exists());
    let marker = exporter.read_marker(id).unwrap();
    assert_eq!(marker.tally.total, 12);

    assert_eq!(store.case_results(id).unwrap().len(), 12);

    let breadcrumbs = store.execution_logs(Some(id), 10).unwrap();
    assert!(breadcrumbs.iter().any(|e| e.message.contains("started")));
    assert!(breadcrumbs.iter().any(|e| e.message.contains("completed")));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_category_with_no_matches_completes_empty() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(
        vec![("Game.SlowTests.test_a", CaseStatus::Passed)],
        Duration::from_millis(5),
    );
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    let id = store
        .enqueue_test(
            TestRequestType::Category,
            TestPlatform::Editor,
            Some("Smoke"),
            0,
        )
        .unwrap();

    let status = wait_terminal(&store, id).await;
    assert_eq!(status, RequestStatus::Completed);

    let request = store.get_test(id).unwrap().unwrap();
    assert_eq!(request.tally.total, 0);
    assert_eq!(request.tally.failed, 0);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_many_pending_requests_run_one_at_a_time() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(
        vec![("Game.FooTests.test_a", CaseStatus::Passed)],
        Duration::from_millis(40),
    );
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator = Coordinator::start_with_store(
        &config,
        hosts(runner.clone(), importer),
        store.clone(),
    )
    .unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            store
                .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
                .unwrap(),
        );
    }

    for id in &ids {
        assert_eq!(wait_terminal(&store, *id).await, RequestStatus::Completed);
    }

    assert_eq!(runner.runs.load(Ordering::SeqCst), 4);
    // The busy flag held executions to one at a time.
    assert_eq!(runner.peak.load(Ordering::SeqCst), 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_running_stays_cancelled() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(
        vec![("Game.FooTests.test_a", CaseStatus::Passed)],
        Duration::from_millis(300),
    );
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();
    {
        let store = store.clone();
        wait_until(
            || {
                store.get_test(id).unwrap().unwrap().status == RequestStatus::Running
            },
            "request to start running",
        )
        .await;
    }

    assert!(store.cancel_test(id).unwrap());
    assert_eq!(
        store.get_test(id).unwrap().unwrap().status,
        RequestStatus::Cancelled
    );

    // Cancellation is advisory: the executor finishes, but its late result
    // must not overwrite the terminal state.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        store.get_test(id).unwrap().unwrap().status,
        RequestStatus::Cancelled
    );

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_survives_storage_outage() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(
        vec![("Game.FooTests.test_a", CaseStatus::Passed)],
        Duration::from_millis(5),
    );
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    // Break the store underneath the poller for a few cycles.
    let conn = rusqlite::Connection::open(&config.storage.db_path).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    conn.execute("DROP TABLE test_requests", []).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Recover and verify the poller still dispatches new work.
    proctor::storage::schema::migrate(&conn).unwrap();
    drop(conn);

    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();
    assert_eq!(wait_terminal(&store, id).await, RequestStatus::Completed);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_orphaned_request_fails_without_marker() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Store::open(&config.storage.db_path).unwrap();

    // Simulate a previous process dying mid-run.
    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();
    assert!(store.mark_test_running(id).unwrap());

    let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    assert_eq!(wait_terminal(&store, id).await, RequestStatus::Failed);
    let request = store.get_test(id).unwrap().unwrap();
    assert!(request.error_message.unwrap().contains("no result found"));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_orphaned_request_completes_from_marker() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Store::open(&config.storage.db_path).unwrap();

    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();
    assert!(store.mark_test_running(id).unwrap());

    // The dead process managed to export artifacts before losing the final
    // status write.
    let request = store.get_test(id).unwrap().unwrap();
    let tally = proctor::model::TestTally {
        total: 5,
        passed: 5,
        failed: 0,
        skipped: 0,
    };
    ResultExporter::new(config.export.results_dir.clone())
        .write_run(&request, &tally, 2.5, &[])
        .unwrap();

    let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    assert_eq!(wait_terminal(&store, id).await, RequestStatus::Completed);
    let request = store.get_test(id).unwrap().unwrap();
    assert_eq!(request.tally, tally);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_host_resumed_triggers_recovery_scan() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    // A row stuck `running` while the coordinator was already up -- e.g. the
    // host spent time in a non-responsive context and the final write never
    // happened. Insert it directly as running so the poller never sees a
    // pending window.
    let conn = rusqlite::Connection::open(&config.storage.db_path).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    conn.execute(
        "INSERT INTO test_requests (request_type, test_platform, status, started_at)
         VALUES ('all', 'editor', 'running', datetime('now'))",
        [],
    )
    .unwrap();
    let id = conn.last_insert_rowid();
    drop(conn);

    coordinator.notify_host_resumed();

    assert_eq!(wait_terminal(&store, id).await, RequestStatus::Failed);
    let request = store.get_test(id).unwrap().unwrap();
    assert!(request.error_message.unwrap().contains("no result found"));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_outcomes_are_distinct() {
    for (outcome, expected_status, needle) in [
        (
            ImportOutcome::Completed,
            RequestStatus::Completed,
            "import completed",
        ),
        (
            ImportOutcome::NoOp,
            RequestStatus::Completed,
            "no assets required import",
        ),
        (
            ImportOutcome::TimedOutUnconfirmed,
            RequestStatus::Failed,
            "unconfirmed",
        ),
    ] {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
        let importer = RecordingImporter::new(outcome);
        let store = Store::open(&config.storage.db_path).unwrap();
        let coordinator = Coordinator::start_with_store(
            &config,
            hosts(runner, importer.clone()),
            store.clone(),
        )
        .unwrap();

        let id = store
            .enqueue_refresh(RefreshType::Full, None, ImportOptions::Default, 0)
            .unwrap();
        {
            let store = store.clone();
            wait_until(
                || {
                    store
                        .get_refresh(id)
                        .unwrap()
                        .map(|r| r.status.is_terminal())
                        .unwrap_or(false)
                },
                "refresh request to finish",
            )
            .await;
        }

        let request = store.get_refresh(id).unwrap().unwrap();
        assert_eq!(request.status, expected_status);
        let message = request
            .result_message
            .or(request.error_message)
            .unwrap_or_default();
        assert!(
            message.contains(needle),
            "expected '{}' in '{}'",
            needle,
            message
        );
        assert_eq!(
            importer.scopes.lock().unwrap().as_slice(),
            &[ImportScope::Everything]
        );

        coordinator.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_console_capture_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator =
        Coordinator::start_with_store(&config, hosts(runner, importer), store.clone()).unwrap();

    coordinator.capture().ingest(LogEvent {
        level: LogLevel::Warning,
        message: "asset bundle missing".to_string(),
        stack_trace: None,
        source_file: Some("Assets/Scripts/Loader.cs".to_string()),
        source_line: Some(88),
    });
    coordinator.capture().ingest(LogEvent {
        level: LogLevel::Exception,
        message: "null reference".to_string(),
        stack_trace: Some(
            "at Engine.Internal.Invoke ()\nat Game.Loader.test_load () in /ci/work/Assets/Tests/LoaderTests.cs:12"
                .to_string(),
        ),
        source_file: None,
        source_line: None,
    });

    {
        let store = store.clone();
        wait_until(
            || {
                store
                    .console_logs(&ConsoleLogQuery {
                        limit: 10,
                        ..Default::default()
                    })
                    .unwrap()
                    .len()
                    == 2
            },
            "console logs to be persisted",
        )
        .await;
    }

    let exceptions = store
        .console_logs(&ConsoleLogQuery {
            limit: 10,
            level: Some(LogLevel::Exception),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(exceptions.len(), 1);
    let entry = &exceptions[0];
    assert_eq!(entry.session_id, coordinator.capture().session_id());
    assert_eq!(entry.frame_count, 2);
    let truncated = entry.truncated_stack.as_ref().unwrap();
    // The framework frame leads, so it is skipped; the user frame survives
    // with its path made project-relative.
    assert!(truncated.contains("Assets/Tests/LoaderTests.cs:12"));
    assert!(!truncated.contains("/ci/work"));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_nudges_host_scheduler() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let runner = ScriptedRunner::new(vec![], Duration::from_millis(5));
    let importer = RecordingImporter::new(ImportOutcome::Completed);
    let scheduler = Arc::new(CountingScheduler {
        ticks: AtomicUsize::new(0),
    });
    let store = Store::open(&config.storage.db_path).unwrap();
    let coordinator = Coordinator::start_with_store(
        &config,
        Hosts {
            runner,
            importer,
            scheduler: Some(scheduler.clone()),
        },
        store.clone(),
    )
    .unwrap();

    let id = store
        .enqueue_test(TestRequestType::All, TestPlatform::Editor, None, 0)
        .unwrap();
    wait_terminal(&store, id).await;

    assert!(scheduler.ticks.load(Ordering::SeqCst) >= 1);

    coordinator.shutdown().await.unwrap();
}
