//! Main-thread dispatcher.
//!
//! The single consumer of the coordination mailbox, the sole caller of the
//! host traits, and the owner of the at-most-one-execution guard. The busy
//! flags are plain bools because only this loop ever touches them.

pub mod recovery;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::capture::ConsoleCapture;
use crate::export::{tally_line, ResultExporter};
use crate::host::{AssetImporter, TestRunner};
use crate::model::{ExecLogLevel, RequestStatus, TestTally};
use crate::refresh::{spawn_refresh, RefreshOutcome};
use crate::runner::{spawn_execute, TestOutcome};
use crate::storage::Store;

/// Messages entering the dispatch loop. Background domains only ever send;
/// the dispatcher is the only receiver.
#[derive(Debug)]
pub enum Signal {
    /// The poller (or an embedder) observed pending rows.
    PendingWork,
    /// The host returned to a responsive state; re-check for orphans.
    HostResumed,
    TestCompleted {
        request_id: i64,
        outcome: TestOutcome,
    },
    RefreshCompleted {
        request_id: i64,
        outcome: RefreshOutcome,
    },
    Shutdown,
}

pub struct Dispatcher {
    store: Store,
    capture: ConsoleCapture,
    exporter: ResultExporter,
    runner: Arc<dyn TestRunner>,
    importer: Arc<dyn AssetImporter>,
    tx: UnboundedSender<Signal>,
    rx: UnboundedReceiver<Signal>,
    drain_interval: Duration,
    test_busy: bool,
    refresh_busy: bool,
    active_test: Option<i64>,
    active_refresh: Option<i64>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        capture: ConsoleCapture,
        exporter: ResultExporter,
        runner: Arc<dyn TestRunner>,
        importer: Arc<dyn AssetImporter>,
        tx: UnboundedSender<Signal>,
        rx: UnboundedReceiver<Signal>,
        drain_interval: Duration,
    ) -> Self {
        Self {
            store,
            capture,
            exporter,
            runner,
            importer,
            tx,
            rx,
            drain_interval,
            test_busy: false,
            refresh_busy: false,
            active_test: None,
            active_refresh: None,
        }
    }

    /// Run until the mailbox closes or a `Shutdown` signal arrives.
    pub async fn run(mut self) {
        // Rows left `running` by a previous process have no live execution
        // behind them anymore; resolve them before taking new work.
        self.recover_orphans();

        let mut drain = tokio::time::interval(self.drain_interval);
        drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    None | Some(Signal::Shutdown) => break,
                    Some(signal) => self.handle(signal),
                },
                _ = drain.tick() => self.drain_console(),
            }
        }
        // Final flush so captured lines survive an orderly shutdown.
        self.drain_console();
        debug!("dispatcher stopped");
    }

    fn handle(&mut self, signal: Signal) {
        match signal {
            Signal::PendingWork => {
                self.maybe_start_test();
                self.maybe_start_refresh();
            }
            Signal::HostResumed => self.recover_orphans(),
            Signal::TestCompleted {
                request_id,
                outcome,
            } => self.finish_test(request_id, outcome),
            Signal::RefreshCompleted {
                request_id,
                outcome,
            } => self.finish_refresh(request_id, outcome),
            Signal::Shutdown => {}
        }
    }

    // ---- test requests ----------------------------------------------------

    fn maybe_start_test(&mut self) {
        if self.test_busy {
            return;
        }
        let request = match self.store.next_pending_test() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read pending test requests");
                return;
            }
        };

        self.test_busy = true;
        self.active_test = Some(request.id);

        // Stale artifacts must be gone before the row flips to running; an
        // external reader polling for output would otherwise pick up files
        // from the previous run.
        if let Err(e) = self.exporter.clear_stale() {
            warn!(error = %e, "could not clear stale result artifacts");
        }

        match self.store.mark_test_running(request.id) {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled (or otherwise moved on) between the read and the
                // claim; leave it alone.
                debug!(id = request.id, "test request no longer pending; skipping");
                self.test_busy = false;
                self.active_test = None;
                return;
            }
            Err(e) => {
                warn!(id = request.id, error = %e, "could not mark test request running");
                self.test_busy = false;
                self.active_test = None;
                return;
            }
        }

        self.capture.set_active_request(Some(request.id));
        self.log_exec(
            Some(request.id),
            ExecLogLevel::Info,
            format!(
                "test run started: {} on {}",
                request.request_type, request.test_platform
            ),
        );
        info!(
            id = request.id,
            request_type = %request.request_type,
            platform = %request.test_platform,
            "dispatching test request"
        );
        spawn_execute(self.runner.clone(), request, self.tx.clone());
    }

    fn finish_test(&mut self, request_id: i64, outcome: TestOutcome) {
        match outcome {
            TestOutcome::Finished(summary) => {
                // Case rows and artifacts (marker included) land before the
                // final row update: a crash in between leaves a recoverable
                // running row, never a completed row without results.
                if let Err(e) = self.store.insert_case_results(request_id, &summary.cases) {
                    warn!(id = request_id, error = %e, "could not persist case results");
                }
                match self.store.get_test(request_id) {
                    Ok(Some(request)) => {
                        if let Err(e) = self.exporter.write_run(
                            &request,
                            &summary.tally,
                            summary.duration_seconds,
                            &summary.cases,
                        ) {
                            warn!(id = request_id, error = %e, "could not export run artifacts");
                        }
                    }
                    Ok(None) => warn!(id = request_id, "finished request row is missing"),
                    Err(e) => warn!(id = request_id, error = %e, "could not re-read request row"),
                }

                let summary_line = tally_line(&summary.tally);
                match self.store.finish_test(
                    request_id,
                    RequestStatus::Completed,
                    &summary.tally,
                    summary.duration_seconds,
                    Some(&summary_line),
                    None,
                ) {
                    Ok(true) => {
                        self.log_exec(
                            Some(request_id),
                            ExecLogLevel::Info,
                            format!("test run completed: {}", summary_line),
                        );
                        info!(id = request_id, summary = %summary_line, "test run completed");
                    }
                    Ok(false) => {
                        // Cancelled mid-run; the terminal state stands, the
                        // artifacts remain for inspection.
                        info!(id = request_id, "test row already terminal; result not applied");
                    }
                    Err(e) => {
                        warn!(id = request_id, error = %e, "could not write final test status");
                    }
                }
            }
            TestOutcome::Faulted {
                message,
                duration_seconds,
            } => {
                self.log_exec(
                    Some(request_id),
                    ExecLogLevel::Error,
                    format!("test run failed: {}", message),
                );
                match self.store.finish_test(
                    request_id,
                    RequestStatus::Failed,
                    &TestTally::default(),
                    duration_seconds,
                    None,
                    Some(&message),
                ) {
                    Ok(_) => warn!(id = request_id, error = %message, "test run failed"),
                    Err(e) => {
                        warn!(id = request_id, error = %e, "could not write failed test status");
                    }
                }
            }
        }

        // Cleanup runs on every path out, so the busy flag cannot wedge.
        self.capture.set_active_request(None);
        self.test_busy = false;
        self.active_test = None;
    }

    // ---- refresh requests -------------------------------------------------

    fn maybe_start_refresh(&mut self) {
        if self.refresh_busy {
            return;
        }
        let request = match self.store.next_pending_refresh() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read pending refresh requests");
                return;
            }
        };

        self.refresh_busy = true;
        self.active_refresh = Some(request.id);

        match self.store.mark_refresh_running(request.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = request.id, "refresh request no longer pending; skipping");
                self.refresh_busy = false;
                self.active_refresh = None;
                return;
            }
            Err(e) => {
                warn!(id = request.id, error = %e, "could not mark refresh request running");
                self.refresh_busy = false;
                self.active_refresh = None;
                return;
            }
        }

        self.log_exec(
            None,
            ExecLogLevel::Info,
            format!("asset refresh started: {}", request.refresh_type),
        );
        info!(id = request.id, refresh_type = %request.refresh_type, "dispatching refresh request");
        spawn_refresh(self.importer.clone(), request, self.tx.clone());
    }

    fn finish_refresh(&mut self, request_id: i64, outcome: RefreshOutcome) {
        match self.store.finish_refresh(
            request_id,
            outcome.status,
            outcome.duration_seconds,
            outcome.result_message.as_deref(),
            outcome.error_message.as_deref(),
        ) {
            Ok(true) => {
                let level = match outcome.status {
                    RequestStatus::Failed => ExecLogLevel::Error,
                    _ => ExecLogLevel::Info,
                };
                self.log_exec(
                    None,
                    level,
                    format!(
                        "asset refresh finished: {} ({})",
                        outcome.status,
                        outcome
                            .result_message
                            .as_deref()
                            .or(outcome.error_message.as_deref())
                            .unwrap_or("no message")
                    ),
                );
                info!(id = request_id, status = %outcome.status, "refresh finished");
            }
            Ok(false) => {
                info!(id = request_id, "refresh row already terminal; result not applied");
            }
            Err(e) => {
                warn!(id = request_id, error = %e, "could not write final refresh status");
            }
        }

        self.refresh_busy = false;
        self.active_refresh = None;
    }

    // ---- shared -----------------------------------------------------------

    fn recover_orphans(&mut self) {
        match recovery::recover(
            &self.store,
            &self.exporter,
            self.active_test,
            self.active_refresh,
        ) {
            Ok(report) if report.completed + report.failed > 0 => {
                info!(
                    completed = report.completed,
                    failed = report.failed,
                    "orphaned requests resolved"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan recovery scan failed"),
        }
    }

    fn drain_console(&mut self) {
        match self.capture.drain_into(&self.store) {
            Ok(0) => {}
            Ok(count) => debug!(count, "console logs persisted"),
            Err(e) => warn!(error = %e, "console drain failed; batch requeued"),
        }
    }

    fn log_exec(&self, request_id: Option<i64>, level: ExecLogLevel, message: String) {
        if let Err(e) = self
            .store
            .append_execution_log(request_id, level, "dispatcher", &message)
        {
            warn!(error = %e, "could not append execution log");
        }
    }
}
