//! Background progress reporting for task runs.
//!
//! Workers and the orchestration layer bump shared atomic counters; a
//! monitor task wakes periodically and logs a summary so long runs can be
//! followed without parsing per-item log lines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of run progress at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Items handed to the runner.
    pub submitted: usize,
    /// Items processed successfully (including dropped ones).
    pub succeeded: usize,
    pub failed: usize,
    /// Successful items the processor filtered out.
    pub dropped: usize,
    /// Items skipped because the checkpoint already records them.
    pub skipped: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Items with a final result.
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Completed items per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Shared atomic counters for progress tracking.
///
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    submitted: Arc<AtomicUsize>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
    skipped: Arc<AtomicUsize>,
    started: Instant,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            submitted: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
            skipped: Arc::new(AtomicUsize::new(0)),
            started: Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a success whose output was filtered out.
    pub fn record_dropped(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// The task is aborted when the monitor is stopped or dropped.
pub struct ProgressMonitor {
    counters: ProgressCounters,
    total: Option<usize>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts logging every `interval`.
    ///
    /// `total` is the expected number of items, when known, and is used for
    /// the completion percentage.
    pub fn start(counters: ProgressCounters, total: Option<usize>, interval: Duration) -> Self {
        let shared = counters.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                log_progress(&shared.snapshot(), total, "Task progress");
            }
        });

        Self {
            counters,
            total,
            handle: Some(handle),
        }
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    /// Stops the monitor and logs a final summary.
    pub fn stop(mut self) -> ProgressSnapshot {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let snapshot = self.counters.snapshot();
        log_progress(&snapshot, self.total, "Task run finished");
        snapshot
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn log_progress(snap: &ProgressSnapshot, total: Option<usize>, message: &str) {
    let pct = match total {
        Some(total) if total > 0 => (snap.completed() as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    };

    tracing::info!(
        submitted = snap.submitted,
        succeeded = snap.succeeded,
        failed = snap.failed,
        dropped = snap.dropped,
        skipped = snap.skipped,
        total = ?total,
        progress_pct = format!("{:.1}%", pct),
        elapsed_secs = snap.elapsed.as_secs(),
        items_per_sec = format!("{:.2}", snap.throughput()),
        "{}",
        message
    );
}
