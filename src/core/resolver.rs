//! Upsert resolution
//!
//! For each batch the resolver fetches the current remote snapshots in one
//! bulk query and decides, per record, whether it is a create or an update.
//! Updates carry the merged record tree and echo the version token observed
//! at resolution time; a stale token surfaces later as a conflict, never
//! as a retry.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::gateway::{GatewayClient, RecordCategory};

use super::merge::{MergeRules, merge_for_update};
use super::record::{Record, set_version};

/// How a resolved record will be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// No remote counterpart; submit as-is
    Create,
    /// Remote counterpart exists; submit the merge result
    Update {
        /// Version token the update must echo
        expected_version: i64,
    },
}

/// One record ready for submission
#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    /// The input record (pre-merge form, for failure capture)
    pub record: Record,
    /// The tree that goes over the wire
    pub outgoing: Value,
    /// Create or update
    pub kind: PlanKind,
}

/// A batch after resolution: submittable plans plus records rejected during
/// resolution, both in input order.
#[derive(Debug, Default)]
pub struct ResolvedBatch {
    /// Records to submit
    pub records: Vec<ResolvedRecord>,
    /// Records rejected during resolution, with reasons
    pub rejected: Vec<(Record, String)>,
}

/// Produces merge plans for batches
#[derive(Clone)]
pub struct UpsertResolver {
    gateway: Arc<dyn GatewayClient>,
    rules: Arc<MergeRules>,
    category: RecordCategory,
    identifier_field: String,
    upsert: bool,
}

impl UpsertResolver {
    /// Create a resolver. With `upsert` off, every record resolves to a
    /// create plan without touching the network.
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        rules: Arc<MergeRules>,
        category: RecordCategory,
        identifier_field: impl Into<String>,
        upsert: bool,
    ) -> Self {
        Self {
            gateway,
            rules,
            category,
            identifier_field: identifier_field.into(),
            upsert,
        }
    }

    /// Resolve one batch. Snapshots are fetched fresh on every call so a
    /// retried batch re-enters resolution with current version tokens.
    pub async fn resolve(&self, records: Vec<Record>) -> Result<ResolvedBatch> {
        if !self.upsert {
            return Ok(ResolvedBatch {
                records: records
                    .into_iter()
                    .map(|record| {
                        let outgoing = record.value().clone();
                        ResolvedRecord {
                            record,
                            outgoing,
                            kind: PlanKind::Create,
                        }
                    })
                    .collect(),
                rejected: Vec::new(),
            });
        }

        let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
        let snapshots = self.gateway.fetch_existing(self.category, &ids).await?;
        debug!(
            batch = records.len(),
            existing = snapshots.len(),
            "resolved snapshots for batch"
        );

        let mut resolved = ResolvedBatch::default();
        for record in records {
            let snapshot = match snapshots.get(record.id()) {
                Some(snapshot) => snapshot,
                None => {
                    let outgoing = record.value().clone();
                    resolved.records.push(ResolvedRecord {
                        record,
                        outgoing,
                        kind: PlanKind::Create,
                    });
                    continue;
                }
            };

            // the identifier always comes from the incoming record and must
            // match the snapshot's
            let snapshot_id = snapshot
                .value
                .get(&self.identifier_field)
                .and_then(Value::as_str);
            if snapshot_id != Some(record.id()) {
                resolved.rejected.push((
                    record,
                    format!(
                        "identifier mismatch: snapshot reports {}",
                        snapshot_id.unwrap_or("<none>")
                    ),
                ));
                continue;
            }

            let mut outgoing = merge_for_update(&snapshot.value, record.value(), &self.rules);
            if let Some(object) = outgoing.as_object_mut() {
                object.insert(
                    self.identifier_field.clone(),
                    Value::String(record.id().to_string()),
                );
            }
            set_version(&mut outgoing, snapshot.version)?;

            resolved.records.push(ResolvedRecord {
                record,
                outgoing,
                kind: PlanKind::Update {
                    expected_version: snapshot.version,
                },
            });
        }
        Ok(resolved)
    }
}
