//! Job orchestration
//!
//! Wires source → pipeline → aggregator for one run and owns the stop
//! signal. The pipeline and the aggregator only ever meet through the event
//! channel; dropping the pipeline's sender is what lets the aggregator
//! finish its summary.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{Result, SyncError};
use crate::gateway::GatewayClient;
use crate::progress::ProgressReporter;

use super::aggregator::{JobSummary, ResultAggregator};
use super::pipeline::SubmissionPipeline;
use super::resolver::UpsertResolver;
use super::retry::RetryPolicy;
use super::source::RecordSource;

/// What a finished run looks like to callers
#[derive(Debug)]
pub struct JobReport {
    /// Aggregate counts; valid even when the run aborted
    pub summary: JobSummary,
    /// The fatal error that aborted the run, if any
    pub fatal: Option<SyncError>,
}

impl JobReport {
    /// Whether the run finished without a fatal error
    pub fn completed(&self) -> bool {
        self.fatal.is_none()
    }
}

/// One bulk synchronization run
pub struct SyncJob {
    config: JobConfig,
    gateway: Arc<dyn GatewayClient>,
    progress: Arc<dyn ProgressReporter>,
    stop: Arc<AtomicBool>,
}

impl SyncJob {
    /// Assemble a job; nothing runs until [`run`](Self::run).
    pub fn new(
        config: JobConfig,
        gateway: Arc<dyn GatewayClient>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            config,
            gateway,
            progress,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for external stop signals: setting it halts dispatch of new
    /// batches while in-flight batches drain.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the job to completion.
    ///
    /// `Err` is reserved for setup failures (unreadable sources, sink
    /// creation); a fatal error during the run drains in-flight batches and
    /// comes back inside the report together with the partial summary.
    pub async fn run(self) -> Result<JobReport> {
        let job_id = Uuid::new_v4();
        let category = self.config.category()?;
        let rules = Arc::new(self.config.merge.compile()?);
        info!(
            %job_id,
            %category,
            upsert = self.config.upsert,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "starting synchronization job"
        );

        let source = RecordSource::open(
            &self.config.sources,
            self.config.batch_size,
            self.config.identifier_field.clone(),
        )
        .await?;

        let (events_tx, events_rx) = mpsc::channel((self.config.concurrency * 2).max(2));
        let aggregator = ResultAggregator::new(
            events_rx,
            self.config.failed_records_file.clone(),
            self.progress.clone(),
        )
        .await?;
        let aggregator = tokio::spawn(aggregator.run());

        let resolver = UpsertResolver::new(
            self.gateway.clone(),
            rules,
            category,
            self.config.identifier_field.clone(),
            self.config.upsert,
        );
        let pipeline = SubmissionPipeline::new(
            self.gateway.clone(),
            resolver,
            RetryPolicy::new(self.config.retry.clone()),
            category,
            self.config.upsert,
            self.config.concurrency,
            events_tx,
            self.stop.clone(),
        );

        let fatal = match pipeline.run(source).await {
            Ok(()) => None,
            Err(err) => Some(err),
        };
        // pipeline dropped its sender; the aggregator can now finish
        drop(pipeline);

        let summary = aggregator
            .await
            .map_err(|err| SyncError::fatal(format!("aggregator task panicked: {err}")))??;

        if let Some(err) = &fatal {
            warn!(%job_id, "job aborted: {err}");
        } else {
            info!(%job_id, "job completed");
        }
        Ok(JobReport { summary, fatal })
    }
}
