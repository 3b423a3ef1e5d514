//! Result export: JUnit-style XML, a plain-text summary, and a JSON recovery
//! marker, one set of files per run.
//!
//! Every artifact is built fully in memory and written atomically, so a
//! concurrent reader either sees the previous complete file or the new
//! complete file, never a partial write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use chrono::{DateTime, Utc};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use serde::{Deserialize, Serialize};

use crate::model::{CaseResult, CaseStatus, TestRequest, TestTally};

/// Recovery marker persisted next to the XML. Orphan recovery reads this to
/// complete a `running` row whose process died between export and the final
/// status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMarker {
    pub request_id: i64,
    pub tally: TestTally,
    pub duration_seconds: f64,
    pub result_summary: String,
    pub completed_at: DateTime<Utc>,
}

/// Writes per-run artifacts into a results directory.
#[derive(Debug, Clone)]
pub struct ResultExporter {
    results_dir: PathBuf,
}

impl ResultExporter {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn xml_path(&self, request_id: i64) -> PathBuf {
        self.results_dir.join(format!("run-{}.xml", request_id))
    }

    pub fn summary_path(&self, request_id: i64) -> PathBuf {
        self.results_dir
            .join(format!("run-{}.summary.txt", request_id))
    }

    pub fn marker_path(&self, request_id: i64) -> PathBuf {
        self.results_dir.join(format!("run-{}.json", request_id))
    }

    /// Remove artifacts left by previous runs so an external reader never
    /// mixes a fresh row with stale files. Returns the number removed.
    pub fn clear_stale(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.results_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("could not list results directory"),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("run-")
                && (name.ends_with(".xml")
                    || name.ends_with(".summary.txt")
                    || name.ends_with(".json"))
            {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("could not remove stale artifact {}", name))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Write the full artifact set for one finished run.
    pub fn write_run(
        &self,
        request: &TestRequest,
        tally: &TestTally,
        duration_seconds: f64,
        cases: &[CaseResult],
    ) -> Result<()> {
        let completed_at = Utc::now();

        let xml = render_xml(request, duration_seconds, cases, completed_at)?;
        write_atomic(&self.xml_path(request.id), xml.as_bytes())?;

        let summary = render_summary(request, tally, duration_seconds, cases, completed_at);
        write_atomic(&self.summary_path(request.id), summary.as_bytes())?;

        let marker = RunMarker {
            request_id: request.id,
            tally: *tally,
            duration_seconds,
            result_summary: tally_line(tally),
            completed_at,
        };
        let marker_json = serde_json::to_vec_pretty(&marker)?;
        write_atomic(&self.marker_path(request.id), &marker_json)?;

        Ok(())
    }

    /// Read the recovery marker for a request, if a complete one exists.
    pub fn read_marker(&self, request_id: i64) -> Option<RunMarker> {
        let bytes = std::fs::read(self.marker_path(request_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// One-line counts summary used in the request row and the marker.
pub fn tally_line(tally: &TestTally) -> String {
    format!(
        "{} total, {} passed, {} failed, {} skipped",
        tally.total, tally.passed, tally.failed, tally.skipped
    )
}

fn render_xml(
    request: &TestRequest,
    duration_seconds: f64,
    cases: &[CaseResult],
    completed_at: DateTime<Utc>,
) -> Result<String> {
    let mut report = Report::new(format!("run-{}", request.id));
    report.set_timestamp(completed_at);
    report.set_time(Duration::from_secs_f64(duration_seconds.max(0.0)));

    // BTreeMap keeps suite order deterministic across renders.
    let mut suites: BTreeMap<String, Vec<&CaseResult>> = BTreeMap::new();
    for case in cases {
        suites.entry(case.suite_name()).or_default().push(case);
    }

    let mut test_suites = Vec::new();
    for (suite_name, suite_cases) in suites {
        let mut suite = TestSuite::new(suite_name.clone());
        for case in suite_cases {
            let status = case_status(case);
            let mut test_case = TestCase::new(case.test_name.clone(), status);
            test_case.set_classname(suite_name.clone());
            test_case.set_time(Duration::from_secs_f64((case.duration_ms / 1000.0).max(0.0)));
            suite.add_test_case(test_case);
        }
        test_suites.push(suite);
    }
    report.add_test_suites(test_suites);

    let mut buf = Vec::new();
    report
        .serialize(&mut buf)
        .context("could not serialize result XML")?;
    String::from_utf8(buf).context("result XML was not valid UTF-8")
}

fn case_status(case: &CaseResult) -> TestCaseStatus {
    match case.result {
        CaseStatus::Passed => TestCaseStatus::success(),
        CaseStatus::Failed => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
            if let Some(message) = &case.error_message {
                status.set_message(message.clone());
            }
            if let Some(stack) = &case.stack_trace {
                status.set_description(stack.clone());
            }
            status
        }
        CaseStatus::Skipped => TestCaseStatus::skipped(),
        CaseStatus::Inconclusive => {
            let mut status = TestCaseStatus::skipped();
            status.set_message("inconclusive");
            status
        }
    }
}

fn render_summary(
    request: &TestRequest,
    tally: &TestTally,
    duration_seconds: f64,
    cases: &[CaseResult],
    completed_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str("Test Run Summary\n");
    out.push_str(&"=".repeat(50));
    out.push('\n');
    out.push_str(&format!("Generated: {}\n", completed_at.to_rfc3339()));
    out.push_str(&format!(
        "Request: #{} ({} on {})\n",
        request.id, request.request_type, request.test_platform
    ));
    if let Some(filter) = &request.test_filter {
        out.push_str(&format!("Filter: {}\n", filter));
    }
    out.push('\n');
    out.push_str("Results:\n");
    out.push_str(&format!("  Total:    {}\n", tally.total));
    out.push_str(&format!("  Passed:   {}\n", tally.passed));
    out.push_str(&format!("  Failed:   {}\n", tally.failed));
    out.push_str(&format!("  Skipped:  {}\n", tally.skipped));
    if tally.total > 0 {
        let rate = (tally.passed as f64 / tally.total as f64) * 100.0;
        out.push_str(&format!("  Pass rate: {:.1}%\n", rate));
    } else {
        out.push_str("  Pass rate: n/a\n");
    }
    out.push_str(&format!("  Duration: {:.2} seconds\n", duration_seconds));

    let failed: Vec<&CaseResult> = cases
        .iter()
        .filter(|c| c.result == CaseStatus::Failed)
        .collect();
    if !failed.is_empty() {
        out.push('\n');
        out.push_str("Failed Tests:\n");
        for case in failed {
            out.push_str(&format!("  [FAILED] {}\n", case.test_name));
            if let Some(message) = &case.error_message {
                if let Some(first_line) = message.lines().next() {
                    out.push_str(&format!("     {}\n", first_line));
                }
            }
        }
    }
    out
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("could not create {}", parent.display()))?;
    }
    let file = AtomicFile::new(path, OverwriteBehavior::AllowOverwrite);
    file.write(|f| f.write_all(bytes))
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}
