//! Background poller.
//!
//! A free-running interval task, deliberately independent of the host's
//! cooperative frame pump: requests are discovered even when the host window
//! is unfocused or minimized. Each tick is an existence check only -- the
//! poller never executes host calls and never mutates store state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::Signal;
use crate::host::HostScheduler;
use crate::storage::Store;

/// Handle to the running poller task. Dropped state is not preserved across
/// host reload boundaries; a new poller reconstructs everything from the
/// store.
pub struct Poller {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Start polling `store` every `interval`, posting `Signal::PendingWork`
    /// into the dispatch mailbox whenever pending rows exist.
    pub fn spawn(
        store: Store,
        tx: UnboundedSender<Signal>,
        wake: Option<Arc<dyn HostScheduler>>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "background poller started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                // A failed tick must never stop future polling.
                match tick(&store) {
                    Ok(true) => {
                        if tx.send(Signal::PendingWork).is_err() {
                            debug!("dispatch mailbox closed; poller exiting");
                            break;
                        }
                        if let Some(scheduler) = &wake {
                            scheduler.request_tick();
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "poll tick failed; retrying next cycle");
                    }
                }
            }
            debug!("background poller stopped");
        });
        Self { shutdown, handle }
    }

    /// Stop the poller and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// One poll cycle: is there any pending work?
pub fn tick(store: &Store) -> Result<bool> {
    Ok(store.has_pending_test()? || store.has_pending_refresh()?)
}
