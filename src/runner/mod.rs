//! Test executor: turns a persisted request into host runner invocations and
//! folds the event stream into a result summary.
//!
//! `spawn_execute` is fire-and-forget from the dispatcher's point of view;
//! the outcome always re-enters the dispatch mailbox as a `TestCompleted`
//! signal, including when wiring the runner fails.

pub mod filter;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

use crate::dispatch::Signal;
use crate::error::CoordinationError;
use crate::host::{RunEvent, TestRunner};
use crate::model::{CaseResult, TestPlatform, TestRequest, TestTally};
use filter::{build_filter, parse_platform, RunFilter};

/// Aggregated outcome of one finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub tally: TestTally,
    pub cases: Vec<CaseResult>,
    pub duration_seconds: f64,
}

/// What the executor reports back to the dispatcher.
///
/// `Finished` covers runs with failing cases -- `failed` request status is
/// reserved for infrastructure faults, carried by `Faulted`.
#[derive(Debug, Clone)]
pub enum TestOutcome {
    Finished(RunSummary),
    Faulted {
        message: String,
        duration_seconds: f64,
    },
}

/// Execute `request` in the background and post the outcome to the mailbox.
pub fn spawn_execute(
    runner: Arc<dyn TestRunner>,
    request: TestRequest,
    tx: UnboundedSender<Signal>,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let request_id = request.id;
        // Run the host call in its own task so even a panicking runner
        // implementation still produces a completion signal.
        let execution = tokio::spawn(async move { execute(runner.as_ref(), &request).await });
        let outcome = match execution.await {
            Ok(Ok(summary)) => TestOutcome::Finished(summary),
            Ok(Err(e)) => TestOutcome::Faulted {
                message: e.to_string(),
                duration_seconds: started.elapsed().as_secs_f64(),
            },
            Err(join_error) => TestOutcome::Faulted {
                message: format!("test executor crashed: {}", join_error),
                duration_seconds: started.elapsed().as_secs_f64(),
            },
        };
        if tx
            .send(Signal::TestCompleted {
                request_id,
                outcome,
            })
            .is_err()
        {
            warn!(id = request_id, "dispatch mailbox closed; test outcome dropped");
        }
    });
}

/// Run the request across its execution context(s), sequentially.
async fn execute(runner: &dyn TestRunner, request: &TestRequest) -> Result<RunSummary> {
    let started = Instant::now();
    let caps = runner.capabilities();

    let (platform, platform_warning) = parse_platform(&request.test_platform);
    if let Some(w) = platform_warning {
        warn!(id = request.id, "{}", w);
    }

    // Only one context may be active at a time on the host, so `both` is two
    // sequential invocations, never a simultaneous pair.
    let contexts: Vec<TestPlatform> = match platform {
        TestPlatform::Both => vec![TestPlatform::Editor, TestPlatform::Runtime],
        single => vec![single],
    };

    if contexts.contains(&TestPlatform::Runtime) && !caps.runtime_context {
        return Err(CoordinationError::ExecutionFailure(
            "host does not expose the runtime execution context".to_string(),
        )
        .into());
    }

    let mut tally = TestTally::default();
    let mut cases = Vec::new();

    for context in contexts {
        let (mut run_filter, warning) =
            build_filter(&request.request_type, request.test_filter.as_deref(), context);
        if let Some(w) = warning {
            warn!(id = request.id, "{}", w);
        }
        if !run_filter.categories.is_empty() && !caps.category_filtering {
            warn!(
                id = request.id,
                "host cannot filter by category; running everything"
            );
            run_filter = RunFilter::unconstrained(context);
        }

        let (context_tally, context_cases) = run_context(runner, run_filter).await?;
        tally.merge(&context_tally);
        cases.extend(context_cases);
    }

    Ok(RunSummary {
        tally,
        cases,
        duration_seconds: started.elapsed().as_secs_f64(),
    })
}

/// One host runner invocation: drive the run and fold its event stream.
async fn run_context(
    runner: &dyn TestRunner,
    run_filter: RunFilter,
) -> Result<(TestTally, Vec<CaseResult>)> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let run = runner.run(run_filter, events_tx);
    let fold = async {
        let mut tally = TestTally::default();
        let mut cases = Vec::new();
        let mut finished = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                RunEvent::RunStarted => {}
                RunEvent::TestStarted { name } => debug!(test = %name, "case started"),
                RunEvent::TestFinished {
                    name,
                    status,
                    duration_ms,
                    message,
                    stack_trace,
                } => {
                    tally.record(status);
                    cases.push(CaseResult {
                        test_name: name,
                        test_class: None,
                        result: status,
                        duration_ms,
                        error_message: message,
                        stack_trace,
                    });
                }
                RunEvent::RunFinished => finished = true,
            }
        }
        (tally, cases, finished)
    };

    let (run_result, (tally, cases, finished)) = tokio::join!(run, fold);
    run_result.map_err(|e| CoordinationError::ExecutionFailure(e.to_string()))?;
    if !finished {
        warn!("runner event stream ended without a run-finished event");
    }
    Ok((tally, cases))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostCapabilities;
    use crate::model::{CaseStatus, RequestStatus};
    use async_trait::async_trait;
    use chrono::Utc;

    struct ScriptedRunner {
        caps: HostCapabilities,
        cases: Vec<(String, CaseStatus)>,
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        fn capabilities(&self) -> HostCapabilities {
            self.caps
        }

        async fn run(
            &self,
            _filter: RunFilter,
            events: mpsc::UnboundedSender<RunEvent>,
        ) -> Result<()> {
            let _ = events.send(RunEvent::RunStarted);
            for (name, status) in &self.cases {
                let _ = events.send(RunEvent::TestStarted { name: name.clone() });
                let _ = events.send(RunEvent::TestFinished {
                    name: name.clone(),
                    status: *status,
                    duration_ms: 1.0,
                    message: None,
                    stack_trace: None,
                });
            }
            let _ = events.send(RunEvent::RunFinished);
            Ok(())
        }
    }

    fn request(platform: &str) -> TestRequest {
        TestRequest {
            id: 1,
            request_type: "all".to_string(),
            test_filter: None,
            test_platform: platform.to_string(),
            status: RequestStatus::Running,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_summary: None,
            error_message: None,
            tally: TestTally::default(),
            duration_seconds: 0.0,
        }
    }

    #[tokio::test]
    async fn test_fold_counts_cases() {
        let runner = ScriptedRunner {
            caps: HostCapabilities::default(),
            cases: vec![
                ("a".to_string(), CaseStatus::Passed),
                ("b".to_string(), CaseStatus::Failed),
                ("c".to_string(), CaseStatus::Skipped),
            ],
        };
        let summary = execute(&runner, &request("editor")).await.unwrap();
        assert_eq!(summary.tally.total, 3);
        assert_eq!(summary.tally.passed, 1);
        assert_eq!(summary.tally.failed, 1);
        assert_eq!(summary.tally.skipped, 1);
        assert_eq!(summary.cases.len(), 3);
    }

    #[tokio::test]
    async fn test_both_runs_each_context_once() {
        let runner = ScriptedRunner {
            caps: HostCapabilities::default(),
            cases: vec![("a".to_string(), CaseStatus::Passed)],
        };
        let summary = execute(&runner, &request("both")).await.unwrap();
        // One case per context, two sequential invocations.
        assert_eq!(summary.tally.total, 2);
        assert_eq!(summary.tally.passed, 2);
    }

    #[tokio::test]
    async fn test_runtime_refused_without_capability() {
        let runner = ScriptedRunner {
            caps: HostCapabilities {
                category_filtering: true,
                runtime_context: false,
            },
            cases: vec![],
        };
        let err = execute(&runner, &request("runtime")).await.unwrap_err();
        assert!(err.to_string().contains("runtime execution context"));
    }

    struct FailingRunner;

    #[async_trait]
    impl TestRunner for FailingRunner {
        async fn run(
            &self,
            _filter: RunFilter,
            _events: mpsc::UnboundedSender<RunEvent>,
        ) -> Result<()> {
            anyhow::bail!("runner registration rejected")
        }
    }

    #[tokio::test]
    async fn test_wiring_failure_becomes_error() {
        let err = execute(&FailingRunner, &request("editor"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("runner registration rejected"));
    }
}
