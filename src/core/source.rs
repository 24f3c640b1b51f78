//! Record source and batcher
//!
//! Produces a lazy, ordered sequence of batches from one or more
//! line-delimited JSON inputs. Sources are enumerated in the order given
//! (directories expand to their files in sorted name order), then read line
//! by line. Lines that fail shape validation never enter a batch; they are
//! collected for the caller to route to the aggregator as rejected.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

use super::record::{Batch, Record, RecordOrigin, RejectedRecord};

/// Streaming reader over the configured input files.
///
/// `next_batch` returns `Ok(None)` at end of stream. Rejected lines are
/// accumulated and drained with [`take_rejected`](Self::take_rejected) after
/// each call.
#[derive(Debug)]
pub struct RecordSource {
    files: Vec<PathBuf>,
    batch_size: usize,
    identifier_field: String,
    file_index: usize,
    reader: Option<BufReader<File>>,
    line_number: u64,
    pending: Option<Record>,
    rejected: Vec<RejectedRecord>,
}

impl RecordSource {
    /// Enumerate the input sources and prepare a lazy reader.
    ///
    /// Paths are kept in the order given; a directory expands to its regular
    /// files sorted by name. An empty expansion is a configuration error.
    pub async fn open(
        paths: &[PathBuf],
        batch_size: usize,
        identifier_field: impl Into<String>,
    ) -> Result<Self> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_dir() {
                files.extend(sorted_dir_entries(path).await?);
            } else {
                files.push(path.clone());
            }
        }
        if files.is_empty() {
            return Err(SyncError::config("no input files to read"));
        }
        debug!(files = files.len(), batch_size, "opened record source");
        Ok(Self {
            files,
            batch_size,
            identifier_field: identifier_field.into(),
            file_index: 0,
            reader: None,
            line_number: 0,
            pending: None,
            rejected: Vec::new(),
        })
    }

    /// The files that will be read, in enumeration order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Next batch of validated records, or `None` at end of stream.
    ///
    /// Batches carry at most `batch_size` records and identifiers are unique
    /// within a batch: a record whose identifier is already present cuts the
    /// batch early and starts the next one.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut records = Vec::with_capacity(self.batch_size);
        let mut seen: HashSet<String> = HashSet::with_capacity(self.batch_size);

        if let Some(pending) = self.pending.take() {
            seen.insert(pending.id().to_string());
            records.push(pending);
        }

        while records.len() < self.batch_size {
            match self.next_record().await? {
                Some(record) => {
                    if seen.contains(record.id()) {
                        debug!(id = record.id(), "duplicate identifier cuts batch early");
                        self.pending = Some(record);
                        break;
                    }
                    seen.insert(record.id().to_string());
                    records.push(record);
                }
                None => break,
            }
        }

        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Batch::new(records)))
        }
    }

    /// Drain records rejected since the last call.
    pub fn take_rejected(&mut self) -> Vec<RejectedRecord> {
        std::mem::take(&mut self.rejected)
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if self.reader.is_none() {
                let path = match self.files.get(self.file_index) {
                    Some(path) => path.clone(),
                    None => return Ok(None),
                };
                let file = File::open(&path).await.map_err(|err| {
                    SyncError::fatal(format!(
                        "cannot read input source {}: {err}",
                        path.display()
                    ))
                })?;
                debug!(file = %path.display(), "reading input source");
                self.reader = Some(BufReader::new(file));
                self.line_number = 0;
            }

            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => continue,
            };
            let mut line = String::new();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                self.reader = None;
                self.file_index += 1;
                continue;
            }
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let origin = RecordOrigin {
                file: self.current_file_name(),
                line: self.line_number,
            };
            match Record::parse(trimmed, origin, &self.identifier_field) {
                Ok(record) => return Ok(Some(record)),
                Err(rejected) => {
                    warn!(
                        origin = %rejected.origin,
                        reason = %rejected.reason,
                        "rejecting malformed record"
                    );
                    self.rejected.push(rejected);
                }
            }
        }
    }

    fn current_file_name(&self) -> String {
        self.files
            .get(self.file_index)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

async fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|err| {
        SyncError::fatal(format!("cannot read input directory {}: {err}", dir.display()))
    })?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    async fn collect_ids(source: &mut RecordSource) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        while let Some(batch) = source.next_batch().await.unwrap() {
            batches.push(batch.ids());
        }
        batches
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "records.jsonl",
            &[r#"{"id": "a"}"#, r#"{"id": "b"}"#, r#"{"id": "c"}"#],
        );

        let mut source = RecordSource::open(&[path], 2, "id").await.unwrap();
        let batches = collect_ids(&mut source).await;
        assert_eq!(batches, vec![vec!["a", "b"], vec!["c"]]);
    }

    #[tokio::test]
    async fn final_batch_may_be_smaller() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "records.jsonl", &[r#"{"id": "a"}"#]);

        let mut source = RecordSource::open(&[path], 100, "id").await.unwrap();
        let batches = collect_ids(&mut source).await;
        assert_eq!(batches, vec![vec!["a"]]);
    }

    #[tokio::test]
    async fn duplicate_identifier_cuts_batch() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "records.jsonl",
            &[r#"{"id": "a", "v": 1}"#, r#"{"id": "a", "v": 2}"#, r#"{"id": "b"}"#],
        );

        let mut source = RecordSource::open(&[path], 10, "id").await.unwrap();
        let batches = collect_ids(&mut source).await;
        assert_eq!(batches, vec![vec!["a"], vec!["a", "b"]]);
    }

    #[tokio::test]
    async fn malformed_lines_are_rejected_not_batched() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "records.jsonl",
            &[r#"{"id": "a"}"#, "{broken", r#"{"noid": true}"#, r#"{"id": "b"}"#],
        );

        let mut source = RecordSource::open(&[path], 10, "id").await.unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.ids(), vec!["a", "b"]);

        let rejected = source.take_rejected();
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].raw, "{broken");
        assert_eq!(rejected[1].raw, r#"{"noid": true}"#);
        assert_eq!(rejected[0].origin.line, 2);
        assert_eq!(rejected[1].origin.line, 3);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "records.jsonl", &[r#"{"id": "a"}"#, "", "  ", r#"{"id": "b"}"#]);

        let mut source = RecordSource::open(&[path], 10, "id").await.unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.ids(), vec!["a", "b"]);
        assert!(source.take_rejected().is_empty());
    }

    #[tokio::test]
    async fn multiple_files_read_in_order() {
        let dir = TempDir::new().unwrap();
        let first = write_file(&dir, "a.jsonl", &[r#"{"id": "a1"}"#, r#"{"id": "a2"}"#]);
        let second = write_file(&dir, "b.jsonl", &[r#"{"id": "b1"}"#]);

        let mut source = RecordSource::open(&[first, second], 10, "id").await.unwrap();
        let batches = collect_ids(&mut source).await;
        assert_eq!(batches, vec![vec!["a1", "a2", "b1"]]);
    }

    #[tokio::test]
    async fn directory_expands_to_sorted_files() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "02.jsonl", &[r#"{"id": "second"}"#]);
        write_file(&dir, "01.jsonl", &[r#"{"id": "first"}"#]);

        let mut source = RecordSource::open(&[dir.path().to_path_buf()], 10, "id")
            .await
            .unwrap();
        let batches = collect_ids(&mut source).await;
        assert_eq!(batches, vec![vec!["first", "second"]]);
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let mut source = RecordSource::open(&[PathBuf::from("/nonexistent/input.jsonl")], 10, "id")
            .await
            .unwrap();
        let err = source.next_batch().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_source_list_is_config_error() {
        let err = RecordSource::open(&[], 10, "id").await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
