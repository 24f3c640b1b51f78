//! Concurrent batch submission
//!
//! A bounded pool of workers consumes batches from the source; each worker
//! owns one batch end-to-end (resolve, submit, classify) and reports a
//! completion event. Transient failures retry the whole batch with backoff;
//! a fatal condition stops dispatch of new batches while in-flight batches
//! drain. No record is ever processed by two workers at once, and record
//! order inside a batch is preserved end-to-end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{Result, SyncError};
use crate::gateway::{GatewayClient, RecordCategory, RecordStatus};

use super::aggregator::{BatchCompletion, Event, RecordOutcome, RecordResult};
use super::record::Batch;
use super::resolver::{PlanKind, ResolvedRecord, UpsertResolver};
use super::retry::{Attempt, RetryPolicy};
use super::source::RecordSource;

/// Runs batches through resolution and submission under a concurrency bound
#[derive(Clone)]
pub struct SubmissionPipeline {
    gateway: Arc<dyn GatewayClient>,
    resolver: UpsertResolver,
    retry: RetryPolicy,
    category: RecordCategory,
    upsert: bool,
    concurrency: usize,
    events: mpsc::Sender<Event>,
    stop: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<SyncError>>>,
}

impl SubmissionPipeline {
    /// Create a pipeline. `stop` halts dispatch of new batches when set;
    /// in-flight batches always run to completion or retry exhaustion.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        resolver: UpsertResolver,
        retry: RetryPolicy,
        category: RecordCategory,
        upsert: bool,
        concurrency: usize,
        events: mpsc::Sender<Event>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            resolver,
            retry,
            category,
            upsert,
            concurrency,
            events,
            stop,
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Drain the source through the worker pool.
    ///
    /// Returns the first fatal error once all in-flight batches have
    /// drained; per-record and per-batch failures never surface here.
    pub async fn run(&self, source: RecordSource) -> Result<()> {
        let stop = self.stop.clone();
        let events = self.events.clone();

        let batches = stream::unfold(source, move |mut source| {
            let stop = stop.clone();
            let events = events.clone();
            async move {
                if stop.load(Ordering::SeqCst) {
                    return None;
                }
                let next = source.next_batch().await;
                for rejected in source.take_rejected() {
                    let _ = events.send(Event::Rejected(rejected)).await;
                }
                match next {
                    Ok(Some(batch)) => Some((Ok(batch), source)),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), source)),
                }
            }
        });

        let completions = batches
            .map(|next| {
                let worker = self.clone();
                async move {
                    match next {
                        Ok(batch) => worker.process_batch(batch).await,
                        Err(err) => Err(err),
                    }
                }
            })
            .buffer_unordered(self.concurrency);
        futures::pin_mut!(completions);

        while let Some(result) = completions.next().await {
            if let Err(err) = result {
                self.note_fatal(err);
            }
        }

        match self.fatal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record the first fatal error and stop dispatching new batches.
    fn note_fatal(&self, err: SyncError) {
        error!("fatal condition; draining in-flight batches: {err}");
        self.stop.store(true, Ordering::SeqCst);
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// One batch end-to-end, with the whole-batch retry loop.
    async fn process_batch(&self, batch: Batch) -> Result<()> {
        let _ = self
            .events
            .send(Event::BatchStarted { size: batch.len() })
            .await;
        let started = Instant::now();

        let mut attempt = 1u32;
        let outcome = loop {
            let outcome = self.attempt_batch(&batch).await;
            match self.retry.evaluate(attempt, &outcome) {
                Attempt::Success | Attempt::GiveUp => break outcome,
                Attempt::Retry(next) => {
                    if let Err(err) = &outcome {
                        warn!(
                            attempt,
                            max_attempts = self.retry.max_attempts(),
                            "batch attempt failed: {err}; backing off"
                        );
                    }
                    self.retry.wait_after(attempt).await;
                    attempt = next;
                }
            }
        };

        match outcome {
            Ok((results, payload_bytes)) => {
                self.complete(results, started, payload_bytes, attempt).await;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                // retry budget exhausted: every record in the batch fails
                let reason = format!("retries exhausted: {err}");
                let results = terminal_results(&batch, RecordOutcome::TransientFailure(reason));
                self.complete(results, started, 0, attempt).await;
                Ok(())
            }
            Err(err) => {
                // fatal: capture the batch for resubmission, then abort
                let reason = format!("job aborted: {err}");
                let results = terminal_results(&batch, RecordOutcome::TransientFailure(reason));
                self.complete(results, started, 0, attempt).await;
                Err(err)
            }
        }
    }

    /// One submission attempt: fresh resolution, one request, per-record
    /// classification.
    async fn attempt_batch(&self, batch: &Batch) -> Result<(Vec<RecordResult>, usize)> {
        let resolved = self.resolver.resolve(batch.records().to_vec()).await?;

        let mut results: Vec<RecordResult> = resolved
            .rejected
            .into_iter()
            .map(|(record, reason)| RecordResult {
                record,
                outcome: RecordOutcome::Rejected(reason),
            })
            .collect();

        if resolved.records.is_empty() {
            return Ok((results, 0));
        }

        let outgoing: Vec<Value> = resolved
            .records
            .iter()
            .map(|planned| planned.outgoing.clone())
            .collect();
        let payload_bytes = serde_json::to_vec(&outgoing).map(|b| b.len()).unwrap_or(0);

        let submission = self
            .gateway
            .submit_batch(self.category, &outgoing, self.upsert)
            .await?;
        let statuses: HashMap<&str, &RecordStatus> = submission.by_id();

        for planned in &resolved.records {
            results.push(classify(planned, statuses.get(planned.record.id()).copied()));
        }
        debug!(
            records = results.len(),
            payload_bytes, "batch attempt classified"
        );
        Ok((results, payload_bytes))
    }

    async fn complete(
        &self,
        results: Vec<RecordResult>,
        started: Instant,
        payload_bytes: usize,
        attempts: u32,
    ) {
        let _ = self
            .events
            .send(Event::BatchCompleted(BatchCompletion {
                results,
                elapsed: started.elapsed(),
                payload_bytes,
                attempts,
            }))
            .await;
    }
}

/// Mark every record of a batch with the same terminal outcome.
fn terminal_results(batch: &Batch, outcome: RecordOutcome) -> Vec<RecordResult> {
    batch
        .records()
        .iter()
        .map(|record| RecordResult {
            record: record.clone(),
            outcome: outcome.clone(),
        })
        .collect()
}

/// Map a service-reported status onto a record; a silent service means the
/// plan applied as resolved.
fn classify(planned: &ResolvedRecord, status: Option<&RecordStatus>) -> RecordResult {
    let outcome = match status {
        Some(RecordStatus::Created) => RecordOutcome::Created,
        Some(RecordStatus::Updated) => RecordOutcome::Updated,
        Some(RecordStatus::Conflict) => {
            let expected = match planned.kind {
                PlanKind::Update { expected_version } => expected_version,
                PlanKind::Create => 0,
            };
            RecordOutcome::Conflict(format!("expected version {expected}"))
        }
        Some(RecordStatus::Rejected { reason }) => RecordOutcome::Rejected(reason.clone()),
        None => match planned.kind {
            PlanKind::Create => RecordOutcome::Created,
            PlanKind::Update { .. } => RecordOutcome::Updated,
        },
    };
    RecordResult {
        record: planned.record.clone(),
        outcome,
    }
}
