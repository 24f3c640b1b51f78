//! Result aggregation
//!
//! One consumer task owns the running totals, the failure sink, and the
//! progress reporter. Workers never touch shared counters; they send events
//! over an mpsc channel and the aggregator folds them in arrival order,
//! which is also the order failed records land in the sink.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::progress::{ProgressReporter, human_readable_size};

use super::record::{Record, RejectedRecord};

/// Terminal outcome of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Applied as a create
    Created,
    /// Applied as an update
    Updated,
    /// Version mismatch; failed without retry
    Conflict(String),
    /// Transient failures exhausted the retry budget
    TransientFailure(String),
    /// Never submitted: malformed or identifier-mismatched
    Rejected(String),
}

impl RecordOutcome {
    /// Whether this outcome counts as a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// One record paired with its terminal outcome
#[derive(Debug, Clone)]
pub struct RecordResult {
    /// The input record
    pub record: Record,
    /// How it ended
    pub outcome: RecordOutcome,
}

/// Everything a worker reports about one finished batch
#[derive(Debug)]
pub struct BatchCompletion {
    /// Per-record results in batch order
    pub results: Vec<RecordResult>,
    /// Wall-clock time the batch spent in the worker
    pub elapsed: Duration,
    /// Serialized size of the submitted payload
    pub payload_bytes: usize,
    /// Submission attempts consumed
    pub attempts: u32,
}

/// Events flowing from the source loop and the workers to the aggregator
#[derive(Debug)]
pub enum Event {
    /// A record failed shape validation before batching
    Rejected(RejectedRecord),
    /// A worker picked up a batch
    BatchStarted {
        /// Records in the batch
        size: usize,
    },
    /// A worker finished a batch
    BatchCompleted(BatchCompletion),
}

/// Aggregate counts for one job
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    /// Records read from the inputs (validated or not)
    pub read: u64,
    /// Records created
    pub created: u64,
    /// Records updated
    pub updated: u64,
    /// Records failed on version conflicts
    pub conflicted: u64,
    /// Records failed after exhausting transient retries
    pub transient_failed: u64,
    /// Records rejected before submission
    pub rejected: u64,
    /// Batches submitted
    pub batches: u64,
    /// When the job started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure sink location, when one was configured and used
    pub failure_sink: Option<PathBuf>,
}

impl JobSummary {
    /// Records that reached a success state
    pub fn succeeded(&self) -> u64 {
        self.created + self.updated
    }

    /// Records that reached a terminal failure state
    pub fn failed(&self) -> u64 {
        self.conflicted + self.transient_failed + self.rejected
    }
}

/// Append-only sink of original input lines for terminally failed records
struct FailureSink {
    writer: BufWriter<File>,
    path: PathBuf,
    records_written: u64,
}

impl FailureSink {
    async fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records_written: 0,
        })
    }

    async fn append(&mut self, raw: &str) -> Result<()> {
        self.writer.write_all(raw.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.records_written += 1;
        Ok(())
    }

    async fn finish(mut self) -> Result<(PathBuf, u64)> {
        self.writer.flush().await?;
        Ok((self.path, self.records_written))
    }
}

/// Single consumer of worker events; owns totals, sink, and progress.
pub struct ResultAggregator {
    events: mpsc::Receiver<Event>,
    sink: Option<FailureSink>,
    progress: Arc<dyn ProgressReporter>,
    summary: JobSummary,
}

impl ResultAggregator {
    /// Create an aggregator; the sink file is created eagerly so a
    /// misconfigured path fails the job before any network traffic.
    pub async fn new(
        events: mpsc::Receiver<Event>,
        failure_sink: Option<PathBuf>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let sink = match failure_sink {
            Some(path) => Some(FailureSink::create(path).await?),
            None => None,
        };
        Ok(Self {
            events,
            sink,
            progress,
            summary: JobSummary {
                started_at: Some(Utc::now()),
                ..JobSummary::default()
            },
        })
    }

    /// Consume events until every sender is dropped, then close out the
    /// summary and the sink.
    pub async fn run(mut self) -> Result<JobSummary> {
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Rejected(rejected) => {
                    self.summary.read += 1;
                    self.summary.rejected += 1;
                    self.capture_failure(&rejected.raw).await;
                }
                Event::BatchStarted { size } => {
                    self.progress.on_batch_start(size);
                }
                Event::BatchCompleted(completion) => {
                    self.fold_completion(completion).await;
                }
            }
        }

        self.summary.finished_at = Some(Utc::now());
        if let Some(sink) = self.sink.take() {
            let (path, written) = sink.finish().await?;
            if written > 0 {
                self.summary.failure_sink = Some(path);
            }
        }
        self.progress.on_job_end(&self.summary);
        Ok(self.summary)
    }

    async fn fold_completion(&mut self, completion: BatchCompletion) {
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for result in &completion.results {
            self.summary.read += 1;
            match &result.outcome {
                RecordOutcome::Created => self.summary.created += 1,
                RecordOutcome::Updated => self.summary.updated += 1,
                RecordOutcome::Conflict(_) => self.summary.conflicted += 1,
                RecordOutcome::TransientFailure(_) => self.summary.transient_failed += 1,
                RecordOutcome::Rejected(_) => self.summary.rejected += 1,
            }
            if result.outcome.is_success() {
                succeeded += 1;
            } else {
                failed += 1;
                self.capture_failure(result.record.raw()).await;
            }
        }
        self.summary.batches += 1;
        debug!(
            batch = self.summary.batches,
            succeeded,
            failed,
            attempts = completion.attempts,
            payload = %human_readable_size(completion.payload_bytes as u64, 2),
            elapsed_ms = completion.elapsed.as_millis() as u64,
            "batch folded into totals"
        );
        self.progress.on_batch_complete(succeeded, failed);
    }

    async fn capture_failure(&mut self, raw: &str) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.append(raw).await {
                // the job must survive a sick sink; totals remain authoritative
                error!("failed to write record to failure sink: {err}");
            }
        }
    }
}

/// Log the final summary the way the job ends every run.
pub fn log_summary(summary: &JobSummary) {
    info!(
        read = summary.read,
        created = summary.created,
        updated = summary.updated,
        conflicted = summary.conflicted,
        transient_failed = summary.transient_failed,
        rejected = summary.rejected,
        batches = summary.batches,
        "job finished"
    );
    if let Some(path) = &summary.failure_sink {
        info!("failed records written to {}", path.display());
    }
}
