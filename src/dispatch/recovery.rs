//! Orphan recovery.
//!
//! A `running` row with no live execution behind it appears after a process
//! restart, or after the host spent time in a non-responsive state where the
//! final status write never happened. The scan resolves each orphan exactly
//! once: from the exported recovery marker when one exists, otherwise to
//! `failed` with an explicit message.

use anyhow::Result;
use tracing::{info, warn};

use crate::error::CoordinationError;
use crate::export::ResultExporter;
use crate::model::{ExecLogLevel, RequestStatus, TestTally};
use crate::storage::Store;

/// What one recovery scan resolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// Orphans completed from exported artifacts.
    pub completed: usize,
    /// Orphans failed with a "no result found" message.
    pub failed: usize,
}

/// Scan for orphaned rows and resolve them. Requests currently executing in
/// this process (`active_test` / `active_refresh`) are not orphans and are
/// skipped.
pub fn recover(
    store: &Store,
    exporter: &ResultExporter,
    active_test: Option<i64>,
    active_refresh: Option<i64>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for request in store.running_tests()? {
        if active_test == Some(request.id) {
            continue;
        }
        match exporter.read_marker(request.id) {
            Some(marker) => {
                store.finish_test(
                    request.id,
                    RequestStatus::Completed,
                    &marker.tally,
                    marker.duration_seconds,
                    Some(&marker.result_summary),
                    None,
                )?;
                store.append_execution_log(
                    Some(request.id),
                    ExecLogLevel::Info,
                    "recovery",
                    "orphaned test run completed from exported results",
                )?;
                info!(id = request.id, "orphaned test run completed from marker");
                report.completed += 1;
            }
            None => {
                let message = CoordinationError::OrphanedRequest(request.id).to_string();
                store.finish_test(
                    request.id,
                    RequestStatus::Failed,
                    &TestTally::default(),
                    0.0,
                    None,
                    Some(&message),
                )?;
                store.append_execution_log(
                    Some(request.id),
                    ExecLogLevel::Warning,
                    "recovery",
                    &message,
                )?;
                warn!(id = request.id, "orphaned test run failed: no result found");
                report.failed += 1;
            }
        }
    }

    for request in store.running_refreshes()? {
        if active_refresh == Some(request.id) {
            continue;
        }
        // Refresh passes leave no artifacts, so an orphan is always a loss.
        let message = CoordinationError::OrphanedRequest(request.id).to_string();
        store.finish_refresh(request.id, RequestStatus::Failed, 0.0, None, Some(&message))?;
        store.append_execution_log(None, ExecLogLevel::Warning, "recovery", &message)?;
        warn!(id = request.id, "orphaned refresh failed: no result found");
        report.failed += 1;
    }

    Ok(report)
}
