//! Record model and shape validation
//!
//! Records are dynamic JSON object trees (`serde_json::Value`); the engine
//! never binds them to a concrete schema. Each record keeps the original
//! input line alongside the parsed tree so that terminal failures can be
//! written to the failure sink in their pre-merge form.

use serde_json::Value;

use crate::error::Result;

/// Wire name of the optimistic-locking version token
pub const VERSION_FIELD: &str = "_version";

/// Where a record came from, for log lines and rejection reasons
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    /// Source file (or stream label)
    pub file: String,
    /// 1-based line number within the source
    pub line: u64,
}

impl std::fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A single input record that passed shape validation
#[derive(Debug, Clone)]
pub struct Record {
    value: Value,
    id: String,
    raw: String,
    origin: RecordOrigin,
}

/// An input line that failed shape validation and never enters a batch
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    /// Original input line
    pub raw: String,
    /// Why the record was rejected
    pub reason: String,
    /// Where the line came from
    pub origin: RecordOrigin,
}

impl Record {
    /// Parse and validate one input line.
    ///
    /// Minimal shape contract: the line is a JSON object carrying a
    /// non-empty string identifier under `identifier_field`. Anything else
    /// is rejected before it can reach a batch or the network.
    pub fn parse(
        line: &str,
        origin: RecordOrigin,
        identifier_field: &str,
    ) -> std::result::Result<Self, RejectedRecord> {
        let reject = |reason: String| RejectedRecord {
            raw: line.to_string(),
            reason,
            origin: origin.clone(),
        };

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => return Err(reject(format!("invalid JSON: {err}"))),
        };

        let object = match value.as_object() {
            Some(object) => object,
            None => return Err(reject("record is not a JSON object".to_string())),
        };

        let id = match object.get(identifier_field).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => {
                return Err(reject(format!("empty identifier field '{identifier_field}'")));
            }
            None => {
                return Err(reject(format!(
                    "missing or non-string identifier field '{identifier_field}'"
                )));
            }
        };

        Ok(Self {
            value,
            id,
            raw: line.to_string(),
            origin,
        })
    }

    /// The record's unique identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The parsed record tree
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The original input line, pre-merge
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Source position of the record
    pub fn origin(&self) -> &RecordOrigin {
        &self.origin
    }
}

/// An ordered, size-bounded group of records; the unit of submission.
///
/// Identifiers are unique within a batch; the batcher enforces this by
/// cutting a batch early rather than admitting a duplicate.
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub(crate) fn new(records: Vec<Record>) -> Self {
        debug_assert!(!records.is_empty());
        Self { records }
    }

    /// Records in input order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty (never true for batches from the source)
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Identifiers in input order
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id().to_string()).collect()
    }

    /// Consume the batch, yielding its records
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Extract the integer version token from a record tree, if present.
pub fn version_of(value: &Value) -> Option<i64> {
    value.get(VERSION_FIELD).and_then(Value::as_i64)
}

/// Attach a version token to a record tree.
///
/// No-op for non-object trees; the engine only submits objects.
pub fn set_version(value: &mut Value, version: i64) -> Result<()> {
    if let Some(object) = value.as_object_mut() {
        object.insert(VERSION_FIELD.to_string(), Value::from(version));
    }
    Ok(())
}
