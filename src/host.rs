//! Contracts for the host-side collaborators.
//!
//! The coordination core never talks to the host directly; it consumes these
//! narrow traits. The embedding process implements them on the dispatch
//! thread's side and hands them in when the coordinator starts.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{CaseStatus, ImportOptions};
use crate::runner::filter::RunFilter;

/// Ordered events emitted by the host's native test runner.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted,
    TestStarted {
        name: String,
    },
    TestFinished {
        name: String,
        status: CaseStatus,
        duration_ms: f64,
        message: Option<String>,
        stack_trace: Option<String>,
    },
    RunFinished,
}

/// What the host runner actually supports, negotiated up front instead of
/// probed at runtime. Every field documents its absence behavior.
#[derive(Debug, Clone, Copy)]
pub struct HostCapabilities {
    /// Category-set filtering. Absent: category requests degrade to an
    /// unconstrained run with a logged warning.
    pub category_filtering: bool,
    /// The runtime execution context. Absent: `runtime`/`both` requests fail
    /// with an explicit message rather than silently running editor-only.
    pub runtime_context: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            category_filtering: true,
            runtime_context: true,
        }
    }
}

/// The host's native test-running capability.
#[async_trait]
pub trait TestRunner: Send + Sync {
    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::default()
    }

    /// Run all tests matching `filter`, streaming events into `events`.
    /// Returns once the run has finished (or failed to start).
    async fn run(&self, filter: RunFilter, events: mpsc::UnboundedSender<RunEvent>) -> Result<()>;
}

/// Scope of an asset-import pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportScope {
    Everything,
    Paths(Vec<String>),
}

/// Explicit import outcome. `NoOp` (nothing to import) and `Completed` are
/// deliberately distinct, as is an import whose completion was never
/// confirmed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    NoOp,
    Completed,
    TimedOutUnconfirmed,
}

/// The host's asset-import capability.
#[async_trait]
pub trait AssetImporter: Send + Sync {
    async fn import(&self, scope: ImportScope, options: ImportOptions) -> Result<ImportOutcome>;
}

/// Optional "please schedule work" hook some hosts expose; the poller nudges
/// it so an unfocused host still wakes its cooperative loop.
pub trait HostScheduler: Send + Sync {
    fn request_tick(&self);
}
