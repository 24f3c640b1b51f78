//! End-to-end pipeline tests over an in-memory gateway
//!
//! The mock gateway keeps a stored-record map with version tokens, so jobs
//! run against it behave like runs against a real service: creates insert,
//! updates bump versions, and scripted failures exercise the retry, conflict,
//! and abort paths.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use recsync::config::{JobConfig, MergeConfig};
use recsync::core::job::SyncJob;
use recsync::core::record::VERSION_FIELD;
use recsync::core::retry::RetryConfig;
use recsync::error::{Result, SyncError};
use recsync::gateway::{
    ExistingSnapshot, GatewayClient, RecordCategory, RecordStatus, SubmissionOutcome,
};
use recsync::progress::NoopProgress;

/// In-memory record store standing in for the remote service
#[derive(Default)]
struct MockGateway {
    store: parking_lot::Mutex<HashMap<String, (Value, i64)>>,
    conflict_ids: parking_lot::Mutex<HashSet<String>>,
    transient_failures: AtomicUsize,
    fatal_on_submit: AtomicBool,
    submit_delay: Duration,
    batch_sizes: parking_lot::Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGateway {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    fn seed(&self, id: &str, value: Value, version: i64) {
        self.store
            .lock()
            .insert(id.to_string(), (value, version));
    }

    fn stored_version(&self, id: &str) -> Option<i64> {
        self.store.lock().get(id).map(|(_, version)| *version)
    }

    fn fail_transiently(&self, times: usize) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    fn conflict_on(&self, id: &str) {
        self.conflict_ids.lock().insert(id.to_string());
    }

    fn max_observed_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn observed_batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn fetch_existing(
        &self,
        _category: RecordCategory,
        ids: &[String],
    ) -> Result<HashMap<String, ExistingSnapshot>> {
        let store = self.store.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                store.get(id).map(|(value, version)| {
                    (
                        id.clone(),
                        ExistingSnapshot {
                            value: value.clone(),
                            version: *version,
                        },
                    )
                })
            })
            .collect())
    }

    async fn submit_batch(
        &self,
        _category: RecordCategory,
        records: &[Value],
        _upsert: bool,
    ) -> Result<SubmissionOutcome> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let result = self.apply(records);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockGateway {
    fn apply(&self, records: &[Value]) -> Result<SubmissionOutcome> {
        if self.fatal_on_submit.load(Ordering::SeqCst) {
            return Err(SyncError::fatal("authentication rejected"));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::transient("service unavailable"));
        }

        self.batch_sizes.lock().push(records.len());
        let conflicts = self.conflict_ids.lock();
        let mut store = self.store.lock();
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if conflicts.contains(&id) {
                statuses.push((id, RecordStatus::Conflict));
                continue;
            }
            match record.get(VERSION_FIELD).and_then(Value::as_i64) {
                Some(version) => {
                    store.insert(id.clone(), (record.clone(), version + 1));
                    statuses.push((id, RecordStatus::Updated));
                }
                None => {
                    store.insert(id.clone(), (record.clone(), 1));
                    statuses.push((id, RecordStatus::Created));
                }
            }
        }
        Ok(SubmissionOutcome { statuses })
    }
}

fn write_input(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn job_config(sources: Vec<PathBuf>, upsert: bool) -> JobConfig {
    JobConfig {
        sources,
        record_type: Some(RecordCategory::Items),
        upsert,
        batch_size: 10,
        concurrency: 2,
        retry: fast_retry(3),
        ..JobConfig::default()
    }
}

async fn run_job(config: JobConfig, gateway: Arc<MockGateway>) -> recsync::JobReport {
    SyncJob::new(config, gateway, Arc::new(NoopProgress))
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn every_record_lands_in_exactly_one_bucket() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        &dir,
        "items.jsonl",
        &[
            r#"{"id": "a", "barcode": "1"}"#,
            r#"{"id": "b", "barcode": "2"}"#,
            "{broken json",
            r#"{"id": "c", "barcode": "3"}"#,
            r#"{"barcode": "no id"}"#,
        ],
    );
    let gateway = Arc::new(MockGateway::new());
    gateway.seed("b", serde_json::json!({"id": "b", "barcode": "old"}), 4);

    let report = run_job(job_config(vec![input], true), gateway.clone()).await;
    let summary = &report.summary;

    assert!(report.completed());
    assert_eq!(summary.read, 5);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.conflicted, 0);
    assert_eq!(summary.transient_failed, 0);
    assert_eq!(
        summary.read,
        summary.created + summary.updated + summary.conflicted + summary.transient_failed
            + summary.rejected
    );
}

#[tokio::test]
async fn dispatched_batches_respect_the_size_bound() {
    let dir = TempDir::new().unwrap();
    let lines: Vec<String> = (0..23).map(|i| format!(r#"{{"id": "rec-{i:02}"}}"#)).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let input = write_input(&dir, "items.jsonl", &refs);

    let gateway = Arc::new(MockGateway::new());
    let mut config = job_config(vec![input], false);
    config.batch_size = 5;

    let report = run_job(config, gateway.clone()).await;
    assert_eq!(report.summary.created, 23);

    let sizes = gateway.observed_batch_sizes();
    assert!(sizes.iter().all(|size| *size <= 5));
    assert_eq!(sizes.iter().sum::<usize>(), 23);
}

#[tokio::test]
async fn conflicted_record_lands_in_the_failure_sink_unmerged() {
    let dir = TempDir::new().unwrap();
    let original_line = r#"{"id": "busy", "barcode": "incoming"}"#;
    let input = write_input(&dir, "items.jsonl", &[original_line, r#"{"id": "calm"}"#]);
    let sink = dir.path().join("failed.jsonl");

    let gateway = Arc::new(MockGateway::new());
    gateway.seed(
        "busy",
        serde_json::json!({"id": "busy", "barcode": "stored", "notes": ["kept"]}),
        7,
    );
    gateway.conflict_on("busy");

    let mut config = job_config(vec![input], true);
    config.failed_records_file = Some(sink.clone());

    let report = run_job(config, gateway).await;
    assert_eq!(report.summary.conflicted, 1);
    assert_eq!(report.summary.created, 1);

    // the sink holds the original input line, not the merged tree
    let contents = std::fs::read_to_string(&sink).unwrap();
    assert_eq!(contents.lines().collect::<Vec<_>>(), vec![original_line]);
    assert_eq!(report.summary.failure_sink.as_deref(), Some(sink.as_path()));
}

#[tokio::test]
async fn transient_failures_retry_the_whole_batch_then_succeed() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "items.jsonl", &[r#"{"id": "a"}"#, r#"{"id": "b"}"#]);

    let gateway = Arc::new(MockGateway::new());
    gateway.fail_transiently(2);

    let report = run_job(job_config(vec![input], false), gateway.clone()).await;
    assert!(report.completed());
    assert_eq!(report.summary.created, 2);
    assert_eq!(report.summary.transient_failed, 0);
    // both records arrived in one batch on the attempt that stuck
    assert_eq!(gateway.observed_batch_sizes(), vec![2]);
}

#[tokio::test]
async fn exhausted_retries_fail_every_record_in_the_batch() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "items.jsonl", &[r#"{"id": "a"}"#, r#"{"id": "b"}"#]);
    let sink = dir.path().join("failed.jsonl");

    let gateway = Arc::new(MockGateway::new());
    gateway.fail_transiently(100);

    let mut config = job_config(vec![input], false);
    config.retry = fast_retry(2);
    config.failed_records_file = Some(sink.clone());

    let report = run_job(config, gateway).await;
    assert!(report.completed());
    assert_eq!(report.summary.transient_failed, 2);
    assert_eq!(report.summary.succeeded(), 0);

    let contents = std::fs::read_to_string(&sink).unwrap();
    assert_eq!(contents.lines().count(), 2);
}

#[tokio::test]
async fn fatal_error_aborts_the_run_and_reports_it() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "items.jsonl", &[r#"{"id": "a"}"#]);

    let gateway = Arc::new(MockGateway::new());
    gateway.fatal_on_submit.store(true, Ordering::SeqCst);

    let report = run_job(job_config(vec![input], false), gateway).await;
    assert!(!report.completed());
    let fatal = report.fatal.unwrap();
    assert!(fatal.is_fatal());
    // the aborted batch is still accounted for and captured
    assert_eq!(report.summary.read, 1);
    assert_eq!(report.summary.transient_failed, 1);
}

#[tokio::test]
async fn in_flight_submissions_never_exceed_the_worker_limit() {
    let dir = TempDir::new().unwrap();
    let lines: Vec<String> = (0..12).map(|i| format!(r#"{{"id": "rec-{i:02}"}}"#)).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let input = write_input(&dir, "items.jsonl", &refs);

    let gateway = Arc::new(MockGateway::new().with_delay(Duration::from_millis(20)));
    let mut config = job_config(vec![input], false);
    config.batch_size = 1;
    config.concurrency = 3;

    let report = run_job(config, gateway.clone()).await;
    assert_eq!(report.summary.created, 12);
    assert!(gateway.max_observed_in_flight() <= 3);
    // with twelve single-record batches the pool actually filled up
    assert!(gateway.max_observed_in_flight() >= 2);
}

#[tokio::test]
async fn second_upsert_run_is_pure_updates() {
    let dir = TempDir::new().unwrap();
    let lines = [
        r#"{"id": "a", "barcode": "1"}"#,
        r#"{"id": "b", "barcode": "2"}"#,
        r#"{"id": "c", "barcode": "3"}"#,
    ];
    let input = write_input(&dir, "items.jsonl", &lines);
    let gateway = Arc::new(MockGateway::new());

    let first = run_job(job_config(vec![input.clone()], true), gateway.clone()).await;
    assert_eq!(first.summary.created, 3);
    assert_eq!(first.summary.updated, 0);

    let second = run_job(job_config(vec![input], true), gateway.clone()).await;
    assert_eq!(second.summary.created, 0);
    assert_eq!(second.summary.updated, 3);
    assert_eq!(second.summary.conflicted, 0);

    // versions moved forward exactly once per applied update
    assert_eq!(gateway.stored_version("a"), Some(2));
}

#[tokio::test]
async fn preservation_rules_shape_the_submitted_update() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        &dir,
        "items.jsonl",
        &[r#"{"id": "a", "statisticalCodeIds": ["B", "C"], "status": {"name": "Available"}}"#],
    );
    let gateway = Arc::new(MockGateway::new());
    gateway.seed(
        "a",
        serde_json::json!({
            "id": "a",
            "statisticalCodeIds": ["A", "B"],
            "status": {"name": "Checked out"}
        }),
        1,
    );

    let mut config = job_config(vec![input], true);
    config.merge = MergeConfig {
        preserve_statistical_codes: true,
        ..MergeConfig::default()
    };

    let report = run_job(config, gateway.clone()).await;
    assert_eq!(report.summary.updated, 1);

    let store = gateway.store.lock();
    let (stored, version) = &store["a"];
    assert_eq!(*version, 2);
    assert_eq!(stored["statisticalCodeIds"], serde_json::json!(["A", "B", "C"]));
    // status is preserved unless the job opts into updating it
    assert_eq!(stored["status"]["name"], "Checked out");
}

#[tokio::test]
async fn patch_mode_submits_existing_record_with_patched_paths() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        &dir,
        "items.jsonl",
        &[r#"{"id": "a", "barcode": "Y", "status": {"name": "Missing"}, "notes": ["n2"]}"#],
    );
    let gateway = Arc::new(MockGateway::new());
    gateway.seed(
        "a",
        serde_json::json!({
            "id": "a",
            "barcode": "X",
            "status": {"name": "Available"},
            "notes": ["n1"]
        }),
        3,
    );

    let mut config = job_config(vec![input], true);
    config.merge = MergeConfig {
        patch_existing_records: true,
        patch_paths: vec!["barcode".to_string()],
        ..MergeConfig::default()
    };

    let report = run_job(config, gateway.clone()).await;
    assert_eq!(report.summary.updated, 1);

    let store = gateway.store.lock();
    let (stored, _) = &store["a"];
    assert_eq!(stored["barcode"], "Y");
    assert_eq!(stored["status"]["name"], "Available");
    assert_eq!(stored["notes"], serde_json::json!(["n1"]));
    assert_eq!(stored[VERSION_FIELD], 3);
}
