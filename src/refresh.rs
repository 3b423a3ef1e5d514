//! Asset refresh executor.
//!
//! Mirrors the test executor shape: the dispatcher fires `spawn_refresh` and
//! the outcome re-enters the mailbox as a `RefreshCompleted` signal on every
//! path, importer errors included.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::dispatch::Signal;
use crate::host::{AssetImporter, ImportOutcome, ImportScope};
use crate::model::{ImportOptions, RefreshRequest, RefreshType, RequestStatus};

/// What the refresh executor reports back to the dispatcher.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub status: RequestStatus,
    pub result_message: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

/// Resolve the import scope from a persisted row.
///
/// A selective request whose path list is missing, empty or unparsable
/// degrades to a full refresh; the note is carried into result_message so
/// the degradation is visible, not silent.
pub fn resolve_scope(request: &RefreshRequest) -> (ImportScope, Option<String>) {
    match RefreshType::parse(&request.refresh_type) {
        Some(RefreshType::Full) => (ImportScope::Everything, None),
        Some(RefreshType::Selective) => {
            let paths: Vec<String> = match request.paths.as_deref() {
                Some(json) => match serde_json::from_str::<Vec<String>>(json) {
                    Ok(list) => list.into_iter().filter(|p| !p.trim().is_empty()).collect(),
                    Err(_) => Vec::new(),
                },
                None => Vec::new(),
            };
            if paths.is_empty() {
                (
                    ImportScope::Everything,
                    Some("selective refresh had no usable paths; degraded to full".to_string()),
                )
            } else {
                (ImportScope::Paths(paths), None)
            }
        }
        None => (
            ImportScope::Everything,
            Some(format!(
                "unknown refresh type '{}'; treated as full",
                request.refresh_type
            )),
        ),
    }
}

/// Execute `request` in the background and post the outcome to the mailbox.
pub fn spawn_refresh(
    importer: Arc<dyn AssetImporter>,
    request: RefreshRequest,
    tx: UnboundedSender<Signal>,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let request_id = request.id;

        let (scope, degrade_note) = resolve_scope(&request);
        let options = ImportOptions::parse(&request.import_options).unwrap_or_else(|| {
            warn!(
                id = request_id,
                options = %request.import_options,
                "unknown import options; using default"
            );
            ImportOptions::Default
        });

        // The host call runs in its own task so a panicking importer still
        // produces a completion signal.
        let import = tokio::spawn(async move { importer.import(scope, options).await });
        let import_result = match import.await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow::anyhow!("asset importer crashed: {}", join_error)),
        };

        let outcome = match import_result {
            Ok(ImportOutcome::NoOp) => RefreshOutcome {
                status: RequestStatus::Completed,
                result_message: Some(join_note(degrade_note, "no assets required import")),
                error_message: None,
                duration_seconds: started.elapsed().as_secs_f64(),
            },
            Ok(ImportOutcome::Completed) => RefreshOutcome {
                status: RequestStatus::Completed,
                result_message: Some(join_note(degrade_note, "import completed")),
                error_message: None,
                duration_seconds: started.elapsed().as_secs_f64(),
            },
            Ok(ImportOutcome::TimedOutUnconfirmed) => RefreshOutcome {
                status: RequestStatus::Failed,
                result_message: degrade_note,
                error_message: Some(
                    "import completion unconfirmed: the host never signalled the pass finished"
                        .to_string(),
                ),
                duration_seconds: started.elapsed().as_secs_f64(),
            },
            Err(e) => RefreshOutcome {
                status: RequestStatus::Failed,
                result_message: degrade_note,
                error_message: Some(e.to_string()),
                duration_seconds: started.elapsed().as_secs_f64(),
            },
        };

        if tx
            .send(Signal::RefreshCompleted {
                request_id,
                outcome,
            })
            .is_err()
        {
            warn!(id = request_id, "dispatch mailbox closed; refresh outcome dropped");
        }
    });
}

fn join_note(note: Option<String>, message: &str) -> String {
    match note {
        Some(n) => format!("{}; {}", n, message),
        None => message.to_string(),
    }
}
