//! Progress reporting
//!
//! The engine forwards progress events through the narrow
//! [`ProgressReporter`] seam; the default implementation renders them as
//! structured log lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use crate::core::aggregator::JobSummary;

/// Receives progress events from the aggregator
pub trait ProgressReporter: Send + Sync {
    /// A batch of `size` records entered a worker
    fn on_batch_start(&self, size: usize);
    /// A batch finished with the given per-record split
    fn on_batch_complete(&self, succeeded: usize, failed: usize);
    /// The job is over
    fn on_job_end(&self, summary: &JobSummary);
}

/// Logs batch progress with running totals and throughput
pub struct LogProgress {
    started: Instant,
    attempted: AtomicU64,
    succeeded: AtomicU64,
}

impl LogProgress {
    /// Create a reporter; throughput is measured from this instant.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for LogProgress {
    fn on_batch_start(&self, size: usize) {
        self.attempted.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        let total_succeeded = self
            .succeeded
            .fetch_add(succeeded as u64, Ordering::Relaxed)
            + succeeded as u64;
        let attempted = self.attempted.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            attempted as f64 / elapsed
        } else {
            0.0
        };
        info!(
            batch_succeeded = succeeded,
            batch_failed = failed,
            attempted,
            succeeded_so_far = total_succeeded,
            "batch complete ({rate:.0} rec/s)"
        );
    }

    fn on_job_end(&self, summary: &JobSummary) {
        crate::core::aggregator::log_summary(summary);
    }
}

/// Swallows progress events; used by tests
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn on_batch_start(&self, _size: usize) {}
    fn on_batch_complete(&self, _succeeded: usize, _failed: usize) {}
    fn on_job_end(&self, _summary: &JobSummary) {}
}

/// Render a byte count the way humans read one, e.g. `1.50MB`.
pub fn human_readable_size(bytes: u64, precision: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.precision$}{}", UNITS[unit])
}
