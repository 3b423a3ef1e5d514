//! proctor -- test-run coordination for single-threaded host applications.
//!
//! A long-running host exposes most of its capability only on one dispatch
//! thread; an external driver wants test runs, asset refreshes and log
//! retrieval anyway, asynchronously and reliably. This crate coordinates the
//! two through a shared SQLite database: the driver enqueues request rows, a
//! background poller discovers them even when the host is unfocused, and a
//! single dispatch loop executes them at most one at a time.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod host;
pub mod model;
pub mod poller;
pub mod refresh;
pub mod runner;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use capture::ConsoleCapture;
use config::CoordinatorConfig;
use dispatch::{Dispatcher, Signal};
use export::ResultExporter;
use host::{AssetImporter, HostScheduler, TestRunner};
use poller::Poller;
use storage::Store;

/// The host-side collaborators handed in by the embedding process.
#[derive(Clone)]
pub struct Hosts {
    pub runner: Arc<dyn TestRunner>,
    pub importer: Arc<dyn AssetImporter>,
    /// Optional "please schedule work" hook; nudged by the poller.
    pub scheduler: Option<Arc<dyn HostScheduler>>,
}

/// Explicit context object owning the store handle, the capture pipeline,
/// the mailbox and both background tasks. Constructed once per process
/// lifetime; there is no global state anywhere in the crate.
pub struct Coordinator {
    store: Store,
    capture: ConsoleCapture,
    tx: mpsc::UnboundedSender<Signal>,
    poller: Poller,
    dispatch: JoinHandle<()>,
}

impl Coordinator {
    /// Open the store and start the poller and dispatch loop.
    pub fn start(config: &CoordinatorConfig, hosts: Hosts) -> Result<Self> {
        let store = Store::open(&config.storage.db_path)?;
        Self::start_with_store(config, hosts, store)
    }

    /// Start against an already-open store (used by embedders and tests).
    pub fn start_with_store(
        config: &CoordinatorConfig,
        hosts: Hosts,
        store: Store,
    ) -> Result<Self> {
        let capture = ConsoleCapture::new(config.capture.capacity, config.truncation.clone());
        let exporter = ResultExporter::new(config.export.results_dir.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let poller = Poller::spawn(
            store.clone(),
            tx.clone(),
            hosts.scheduler.clone(),
            Duration::from_millis(config.poller.interval_ms.max(1)),
        );

        let dispatcher = Dispatcher::new(
            store.clone(),
            capture.clone(),
            exporter,
            hosts.runner,
            hosts.importer,
            tx.clone(),
            rx,
            Duration::from_millis(config.capture.drain_interval_ms.max(1)),
        );
        let dispatch = tokio::spawn(dispatcher.run());

        tracing::info!(
            db = %config.storage.db_path.display(),
            session = capture.session_id(),
            "coordinator started"
        );

        Ok(Self {
            store,
            capture,
            tx,
            poller,
            dispatch,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Capture handle for the host's log hook; cheap to clone into any
    /// producer thread.
    pub fn capture(&self) -> &ConsoleCapture {
        &self.capture
    }

    /// Ask the dispatch loop to check the queues now, without waiting for
    /// the next poll cycle.
    pub fn notify_pending(&self) {
        let _ = self.tx.send(Signal::PendingWork);
    }

    /// Tell the dispatcher the host regained a responsive state, triggering
    /// an orphan recovery scan.
    pub fn notify_host_resumed(&self) {
        let _ = self.tx.send(Signal::HostResumed);
    }

    /// Stop the poller, drain the mailbox and wait for the dispatch loop.
    pub async fn shutdown(self) -> Result<()> {
        self.poller.stop().await;
        let _ = self.tx.send(Signal::Shutdown);
        self.dispatch.await?;
        Ok(())
    }
}
