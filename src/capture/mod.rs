//! Console capture pipeline.
//!
//! Producers on any thread push log events into a bounded in-memory queue;
//! the dispatch loop periodically swaps the queue out and persists the batch
//! in one transaction. Capacity overflow drops the oldest entries first --
//! recency beats completeness for interactive debugging.

pub mod truncate;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::config::TruncationConfig;
use crate::model::{ConsoleLogEntry, LogLevel};
use crate::storage::Store;

pub use truncate::{truncate_stack, Truncation};

/// One log event as produced by the host's log hook.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub stack_trace: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<i64>,
}

struct CaptureInner {
    session_id: String,
    capacity: usize,
    truncation: TruncationConfig,
    queue: Mutex<VecDeque<ConsoleLogEntry>>,
    dropped: AtomicU64,
    // 0 = no run in progress.
    active_request: AtomicI64,
}

/// Cheap-to-clone handle shared between producer threads and the dispatcher.
#[derive(Clone)]
pub struct ConsoleCapture {
    inner: Arc<CaptureInner>,
}

impl ConsoleCapture {
    pub fn new(capacity: usize, truncation: TruncationConfig) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                session_id: Uuid::new_v4().to_string(),
                capacity: capacity.max(1),
                truncation,
                queue: Mutex::new(VecDeque::new()),
                dropped: AtomicU64::new(0),
                active_request: AtomicI64::new(0),
            }),
        }
    }

    /// Session identifier, stable for the process lifetime.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Associate subsequently captured lines with a running request.
    pub fn set_active_request(&self, request_id: Option<i64>) {
        self.inner
            .active_request
            .store(request_id.unwrap_or(0), Ordering::SeqCst);
    }

    /// Ingest one event. Callable from any thread; never blocks on storage
    /// and never panics past this boundary.
    pub fn ingest(&self, event: LogEvent) {
        let (truncated_stack, frame_count, is_truncated) = match event.stack_trace.as_deref() {
            Some(raw) if !raw.is_empty() => {
                let truncation = &self.inner.truncation;
                match catch_unwind(AssertUnwindSafe(|| truncate_stack(raw, truncation))) {
                    Ok(t) => (Some(t.text), t.frame_count, t.is_truncated),
                    // Degrade to the untouched raw trace rather than losing
                    // the entry or unwinding into the producer.
                    Err(_) => (Some(raw.to_string()), raw.lines().count() as i64, false),
                }
            }
            _ => (None, 0, false),
        };

        let active = self.inner.active_request.load(Ordering::SeqCst);
        let entry = ConsoleLogEntry {
            session_id: self.inner.session_id.clone(),
            log_level: event.level,
            message: event.message,
            stack_trace: event.stack_trace,
            truncated_stack,
            source_file: event.source_file,
            source_line: event.source_line,
            timestamp: Utc::now(),
            frame_count,
            is_truncated,
            request_id: if active > 0 { Some(active) } else { None },
        };

        let mut queue = match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(entry);
    }

    /// Swap the queue for an empty one and return the captured batch.
    pub fn drain(&self) -> Vec<ConsoleLogEntry> {
        let mut queue = match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *queue).into_iter().collect()
    }

    /// Drain and persist in one transaction. On storage failure the batch is
    /// requeued (oldest-first, still subject to capacity) for the next drain.
    pub fn drain_into(&self, store: &Store) -> Result<usize> {
        let batch = self.drain();
        if batch.is_empty() {
            return Ok(0);
        }
        match store.insert_console_batch(&batch) {
            Ok(n) => Ok(n),
            Err(e) => {
                let mut queue = match self.inner.queue.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for entry in batch.into_iter().rev() {
                    if queue.len() >= self.inner.capacity {
                        break;
                    }
                    queue.push_front(entry);
                }
                Err(e)
            }
        }
    }

    pub fn queued(&self) -> usize {
        match self.inner.queue.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Entries discarded to the drop-oldest policy since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}
