//! HTTP implementation of the gateway client
//!
//! Wire contract, kept deliberately generic over record categories:
//!
//! - fetch: `GET {base}{query_path}?query=id==("a" or "b")&limit=n`, the
//!   response wraps matching records in an array under the category's
//!   envelope key.
//! - submit: `POST {base}{batch_path}?upsert=bool` with the records wrapped
//!   under the same envelope key. A success response may carry per-record
//!   results; when it does not, created/updated is inferred from the version
//!   token each submitted record carries. Failure statuses 409/400/413/422
//!   map to per-record conflict/rejected entries (the response body may name
//!   individual records; unnamed records take the blanket status). 5xx and
//!   timeouts surface as transient errors for the batch retry loop, and a
//!   401 triggers one single-flight token refresh and replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::core::record::version_of;
use crate::error::{Result, SyncError};

use super::auth::{TENANT_HEADER, TOKEN_HEADER, TokenManager, join_path};
use super::{ExistingSnapshot, GatewayClient, RecordCategory, RecordStatus, SubmissionOutcome};

/// Configuration for the HTTP gateway client
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Base URL of the record-storage service
    pub base_url: Url,
    /// Per-request timeout
    pub timeout: Duration,
    /// Name of the identifier field on record trees
    pub identifier_field: String,
}

/// Build the shared HTTP client the gateway and token manager use.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("recsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| SyncError::config(format!("failed to build HTTP client: {err}")))
}

/// reqwest-backed [`GatewayClient`]
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
    tokens: Arc<TokenManager>,
}

impl HttpGateway {
    /// Create a gateway sharing `client` with the token manager.
    pub fn new(client: Client, config: HttpGatewayConfig, tokens: Arc<TokenManager>) -> Self {
        Self {
            client,
            config,
            tokens,
        }
    }

    /// Send a request with the current session token, replaying once with a
    /// refreshed token if the service rejects it.
    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let token = self.tokens.token().await?;
        let replay = builder.try_clone();
        let response = builder
            .header(TOKEN_HEADER, &token)
            .send()
            .await
            .map_err(SyncError::from)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("session token rejected; refreshing");
        let builder = replay.ok_or_else(|| {
            SyncError::fatal("authentication rejected and request cannot be replayed")
        })?;
        let refreshed = self.tokens.force_refresh(&token).await?;
        let response = builder
            .header(TOKEN_HEADER, refreshed)
            .send()
            .await
            .map_err(SyncError::from)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SyncError::fatal(
                "authentication rejected after token refresh",
            ));
        }
        Ok(response)
    }

    fn identifier_of<'a>(&self, record: &'a Value) -> Option<&'a str> {
        record
            .get(&self.config.identifier_field)
            .and_then(Value::as_str)
    }

    /// Per-record statuses for a successful submission: body entries win,
    /// otherwise created/updated is inferred from the version token.
    fn success_outcome(&self, records: &[Value], body: &str) -> SubmissionOutcome {
        let mut statuses: Vec<(String, RecordStatus)> = records
            .iter()
            .filter_map(|record| {
                let id = self.identifier_of(record)?;
                let status = if version_of(record).is_some() {
                    RecordStatus::Updated
                } else {
                    RecordStatus::Created
                };
                Some((id.to_string(), status))
            })
            .collect();
        overlay_body_statuses(&mut statuses, body);
        SubmissionOutcome { statuses }
    }

    /// Per-record statuses for a failed submission: every record takes the
    /// blanket status unless the body names it with a different one.
    fn failure_outcome(
        &self,
        records: &[Value],
        body: &str,
        blanket: RecordStatus,
    ) -> SubmissionOutcome {
        let mut statuses: Vec<(String, RecordStatus)> = records
            .iter()
            .filter_map(|record| {
                let id = self.identifier_of(record)?;
                Some((id.to_string(), blanket.clone()))
            })
            .collect();
        overlay_body_statuses(&mut statuses, body);
        SubmissionOutcome { statuses }
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn fetch_existing(
        &self,
        category: RecordCategory,
        ids: &[String],
    ) -> Result<HashMap<String, ExistingSnapshot>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let info = category.api_info();
        let url = join_path(&self.config.base_url, info.query_path)?;
        let query = id_query(&self.config.identifier_field, ids);
        let limit = ids.len().to_string();

        let builder = self
            .client
            .get(url)
            .header(TENANT_HEADER, self.tokens.tenant())
            .query(&[("query", query.as_str()), ("limit", limit.as_str())]);
        let response = self.execute(builder).await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::transient(format!(
                "snapshot fetch failed with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(SyncError::fatal(format!(
                "snapshot fetch failed with status {status}"
            )));
        }

        let body: Value = response.json().await.map_err(SyncError::from)?;
        let records = body
            .get(info.result_key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut snapshots = HashMap::with_capacity(records.len());
        for record in records {
            let id = match self.identifier_of(&record) {
                Some(id) => id.to_string(),
                None => {
                    warn!(%category, "dropping stored record without an identifier");
                    continue;
                }
            };
            let version = version_of(&record).unwrap_or(0);
            snapshots.insert(
                id,
                ExistingSnapshot {
                    value: record,
                    version,
                },
            );
        }
        debug!(%category, requested = ids.len(), found = snapshots.len(), "fetched snapshots");
        Ok(snapshots)
    }

    async fn submit_batch(
        &self,
        category: RecordCategory,
        records: &[Value],
        upsert: bool,
    ) -> Result<SubmissionOutcome> {
        let info = category.api_info();
        if upsert && !info.supports_upsert {
            return Err(SyncError::fatal(format!(
                "record category '{category}' does not support upsert"
            )));
        }

        let url = join_path(&self.config.base_url, info.batch_path)?;
        let mut envelope = serde_json::Map::new();
        envelope.insert(info.result_key.to_string(), Value::Array(records.to_vec()));

        let builder = self
            .client
            .post(url)
            .header(TENANT_HEADER, self.tokens.tenant())
            .query(&[("upsert", if upsert { "true" } else { "false" })])
            .json(&Value::Object(envelope));
        let response = self.execute(builder).await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::transient(format!(
                "batch submission failed with status {status}"
            )));
        }
        let body = response.text().await.map_err(SyncError::from)?;

        if status.is_success() {
            return Ok(self.success_outcome(records, &body));
        }
        match status {
            StatusCode::CONFLICT => Ok(self.failure_outcome(records, &body, RecordStatus::Conflict)),
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => Ok(self.failure_outcome(
                records,
                &body,
                RecordStatus::Rejected {
                    reason: format!("rejected with status {status}"),
                },
            )),
            _ => Err(SyncError::fatal(format!(
                "unexpected status {status} from batch endpoint"
            ))),
        }
    }
}

/// CQL-style identifier query: `id=="a"` or `id==("a" or "b")`.
fn id_query(field: &str, ids: &[String]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("\"{id}\"")).collect();
    if quoted.len() == 1 {
        format!("{field}=={}", quoted[0])
    } else {
        format!("{field}==({})", quoted.join(" or "))
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponseBody {
    #[serde(default)]
    results: Vec<RecordStatusEntry>,
    #[serde(default)]
    errors: Vec<RecordStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct RecordStatusEntry {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RecordStatusEntry {
    fn to_status(&self) -> Option<RecordStatus> {
        match self.status.as_deref() {
            Some("created") => Some(RecordStatus::Created),
            Some("updated") => Some(RecordStatus::Updated),
            Some("conflict") => Some(RecordStatus::Conflict),
            Some("rejected") => Some(RecordStatus::Rejected {
                reason: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "rejected by service".to_string()),
            }),
            _ => None,
        }
    }
}

/// Replace baseline statuses with any the response body names explicitly.
fn overlay_body_statuses(statuses: &mut [(String, RecordStatus)], body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let parsed: BatchResponseBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    for entry in parsed.results.iter().chain(parsed.errors.iter()) {
        if let Some(status) = entry.to_status() {
            if let Some(slot) = statuses.iter_mut().find(|(id, _)| *id == entry.id) {
                slot.1 = status;
            }
        }
    }
}
