//! Gateway client for the remote record-storage service
//!
//! The engine talks to the service through the narrow [`GatewayClient`]
//! seam: bulk-fetch existing snapshots by identifier, and submit one batch
//! as a single request that reports a per-record status. The HTTP
//! implementation lives in [`http`]; authentication lifecycle in [`auth`].

pub mod auth;
pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use auth::{Credentials, TokenManager};
pub use http::{HttpGateway, HttpGatewayConfig};

/// The remote service's current stored value for one identifier, plus the
/// version token an update must echo. Fetched fresh per run, never cached.
#[derive(Debug, Clone)]
pub struct ExistingSnapshot {
    /// Stored record tree
    pub value: Value,
    /// Optimistic-locking version token
    pub version: i64,
}

/// Per-record status reported by the service for one batch submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// Applied as a create
    Created,
    /// Applied as an update
    Updated,
    /// Version mismatch; another writer got there first
    Conflict,
    /// The service refused the record
    Rejected {
        /// Service-provided reason
        reason: String,
    },
}

/// Result of submitting one batch: a status per record, in no guaranteed
/// order, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct SubmissionOutcome {
    /// (identifier, status) pairs
    pub statuses: Vec<(String, RecordStatus)>,
}

impl SubmissionOutcome {
    /// Index the outcome by identifier
    pub fn by_id(&self) -> HashMap<&str, &RecordStatus> {
        self.statuses
            .iter()
            .map(|(id, status)| (id.as_str(), status))
            .collect()
    }
}

/// Endpoint metadata for one record category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiInfo {
    /// Query endpoint for fetching existing records
    pub query_path: &'static str,
    /// Batch create/update endpoint
    pub batch_path: &'static str,
    /// Envelope key wrapping record arrays in requests and responses
    pub result_key: &'static str,
    /// Whether the batch endpoint honors the upsert flag
    pub supports_upsert: bool,
}

/// Record categories the service exposes batch endpoints for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecordCategory {
    /// Item records
    Items,
    /// Holdings records
    Holdings,
    /// Instance records
    Instances,
    /// User records (no upsert support on the batch endpoint)
    Users,
}

impl RecordCategory {
    /// Endpoint metadata for this category
    pub fn api_info(&self) -> ApiInfo {
        match self {
            Self::Items => ApiInfo {
                query_path: "/item-storage/items",
                batch_path: "/item-storage/batch/synchronous",
                result_key: "items",
                supports_upsert: true,
            },
            Self::Holdings => ApiInfo {
                query_path: "/holdings-storage/holdings",
                batch_path: "/holdings-storage/batch/synchronous",
                result_key: "holdingsRecords",
                supports_upsert: true,
            },
            Self::Instances => ApiInfo {
                query_path: "/instance-storage/instances",
                batch_path: "/instance-storage/batch/synchronous",
                result_key: "instances",
                supports_upsert: true,
            },
            Self::Users => ApiInfo {
                query_path: "/users",
                batch_path: "/user-import",
                result_key: "users",
                supports_upsert: false,
            },
        }
    }
}

impl std::fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Items => "items",
            Self::Holdings => "holdings",
            Self::Instances => "instances",
            Self::Users => "users",
        };
        f.write_str(name)
    }
}

/// Narrow seam between the reconciliation engine and the remote service.
///
/// Both operations may fail wholesale with a transient error (the caller
/// retries the batch) or a fatal one (the job aborts).
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Fetch current snapshots for the given identifiers.
    ///
    /// Identifiers with no stored counterpart are simply absent from the
    /// returned map.
    async fn fetch_existing(
        &self,
        category: RecordCategory,
        ids: &[String],
    ) -> Result<HashMap<String, ExistingSnapshot>>;

    /// Submit one batch as a single request.
    async fn submit_batch(
        &self,
        category: RecordCategory,
        records: &[Value],
        upsert: bool,
    ) -> Result<SubmissionOutcome>;
}
