//! Configuration management for synchronization jobs
//!
//! A job is described by a YAML file, environment variables, CLI flags, or
//! any overlay of the three (file first, then env, then CLI). Validation
//! happens once, after the overlay, so every component downstream can trust
//! the bounds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::core::merge::{FieldPath, MergeRules, StatusRule};
use crate::core::retry::RetryConfig;
use crate::error::{Result, SyncError};
use crate::gateway::RecordCategory;

/// Largest admissible batch
pub const MAX_BATCH_SIZE: usize = 1000;

fn default_batch_size() -> usize {
    250
}

fn default_concurrency() -> usize {
    10
}

fn default_identifier_field() -> String {
    "id".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_token_ttl_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Connection settings for the record-storage service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the service gateway
    #[serde(default)]
    pub base_url: String,
    /// Tenant identifier
    #[serde(default)]
    pub tenant: String,
    /// Username to log in with
    #[serde(default)]
    pub username: String,
    /// Password; normally supplied via environment, never serialized back out
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Assumed session token lifetime in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            tenant: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate the base URL.
    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|err| SyncError::config(format!("invalid gateway URL '{}': {err}", self.base_url)))
    }
}

/// Field-merge behavior for upsert jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Keep existing statistical code lists, unioned with incoming ones
    #[serde(default)]
    pub preserve_statistical_codes: bool,
    /// Keep existing administrative note lists, unioned with incoming ones
    #[serde(default)]
    pub preserve_administrative_notes: bool,
    /// Keep existing temporary location and loan type values verbatim
    #[serde(default)]
    pub preserve_temporary_locations: bool,
    /// Let the incoming status win instead of keeping the existing one
    #[serde(default)]
    pub update_status: bool,
    /// Additional collection fields to preserve (dot-delimited paths)
    #[serde(default)]
    pub preserve_collections: Vec<String>,
    /// Additional scalar fields to preserve (dot-delimited paths)
    #[serde(default)]
    pub preserve_scalars: Vec<String>,
    /// Restrict updates to the listed paths, leaving all else untouched
    #[serde(default)]
    pub patch_existing_records: bool,
    /// Paths overwritten in patch mode (dot-delimited)
    #[serde(default)]
    pub patch_paths: Vec<String>,
}

impl MergeConfig {
    /// Whether any preservation rule is configured
    fn uses_preservation(&self) -> bool {
        self.preserve_statistical_codes
            || self.preserve_administrative_notes
            || self.preserve_temporary_locations
            || self.update_status
            || !self.preserve_collections.is_empty()
            || !self.preserve_scalars.is_empty()
    }

    /// Compile the configuration into the rule set the merge engine runs.
    /// Paths are parsed here, once per job.
    pub fn compile(&self) -> Result<MergeRules> {
        let mut rules = MergeRules::default();

        if self.patch_existing_records {
            let mut paths = Vec::with_capacity(self.patch_paths.len());
            for raw in &self.patch_paths {
                paths.push(FieldPath::parse(raw)?);
            }
            rules.patch_paths = Some(paths);
            return Ok(rules);
        }

        if self.preserve_statistical_codes {
            rules
                .preserve_collections
                .push(FieldPath::parse("statisticalCodeIds")?);
        }
        if self.preserve_administrative_notes {
            rules
                .preserve_collections
                .push(FieldPath::parse("administrativeNotes")?);
        }
        for raw in &self.preserve_collections {
            rules.preserve_collections.push(FieldPath::parse(raw)?);
        }

        if self.preserve_temporary_locations {
            rules
                .preserve_scalars
                .push(FieldPath::parse("temporaryLocationId")?);
            rules
                .preserve_scalars
                .push(FieldPath::parse("temporaryLoanTypeId")?);
        }
        for raw in &self.preserve_scalars {
            rules.preserve_scalars.push(FieldPath::parse(raw)?);
        }

        rules.status = if self.update_status {
            StatusRule::Overwrite
        } else {
            StatusRule::Preserve
        };

        Ok(rules)
    }
}

/// Complete description of one synchronization job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Connection settings
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Input files or directories, read in order
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Record category the inputs belong to
    #[serde(default)]
    pub record_type: Option<RecordCategory>,
    /// Records per submitted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent batch workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Create-or-update instead of create-only
    #[serde(default)]
    pub upsert: bool,
    /// Name of the identifier field on record trees
    #[serde(default = "default_identifier_field")]
    pub identifier_field: String,
    /// Field-merge behavior
    #[serde(default)]
    pub merge: MergeConfig,
    /// Retry/backoff behavior
    #[serde(default)]
    pub retry: RetryConfig,
    /// Where to write terminally failed records; no sink when absent
    #[serde(default)]
    pub failed_records_file: Option<PathBuf>,
    /// Exit non-zero when any record failed
    #[serde(default = "default_true")]
    pub fail_on_errors: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            sources: Vec::new(),
            record_type: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            upsert: false,
            identifier_field: default_identifier_field(),
            merge: MergeConfig::default(),
            retry: RetryConfig::default(),
            failed_records_file: None,
            fail_on_errors: true,
        }
    }
}

impl JobConfig {
    /// Load a configuration file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path).await.map_err(|err| {
            SyncError::config(format!("failed to read config file {}: {err}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|err| SyncError::config(format!("failed to parse config: {err}")))?;
        debug!("configuration loaded");
        Ok(config)
    }

    /// The configured record category.
    pub fn category(&self) -> Result<RecordCategory> {
        self.record_type
            .ok_or_else(|| SyncError::config("no record type configured"))
    }

    /// Validate the overlaid configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(SyncError::config("at least one input source is required"));
        }
        let category = self.category()?;

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(SyncError::config(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.concurrency == 0 {
            return Err(SyncError::config("concurrency must be at least 1"));
        }
        if self.identifier_field.is_empty() {
            return Err(SyncError::config("identifier field must not be empty"));
        }

        if self.gateway.base_url.is_empty() {
            return Err(SyncError::config("gateway URL is required"));
        }
        self.gateway.url()?;
        if self.gateway.tenant.is_empty() {
            return Err(SyncError::config("tenant is required"));
        }
        if self.gateway.username.is_empty() {
            return Err(SyncError::config("username is required"));
        }

        if self.upsert && !category.api_info().supports_upsert {
            return Err(SyncError::config(format!(
                "record category '{category}' does not support upsert"
            )));
        }

        let merge = &self.merge;
        if merge.patch_existing_records {
            if !self.upsert {
                return Err(SyncError::config(
                    "patching existing records requires upsert mode",
                ));
            }
            if merge.patch_paths.is_empty() {
                return Err(SyncError::config(
                    "patch mode requires at least one patch path",
                ));
            }
            if merge.uses_preservation() {
                return Err(SyncError::config(
                    "patch mode and preservation rules are mutually exclusive",
                ));
            }
        } else if !merge.patch_paths.is_empty() {
            return Err(SyncError::config(
                "patch paths given but patch mode is not enabled",
            ));
        }

        // surface malformed paths at load time, not at first merge
        merge.compile()?;
        Ok(())
    }
}
