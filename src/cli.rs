//! Command-line interface
//!
//! Flags overlay the optional configuration file; anything not given on the
//! command line falls back to the file, then to defaults. Validation runs
//! once on the final overlay.

use std::path::PathBuf;

use clap::Parser;

use crate::config::JobConfig;
use crate::error::Result;
use crate::gateway::RecordCategory;

/// Bulk-synchronize line-delimited record sets against a record-storage
/// service's batch APIs.
#[derive(Debug, Parser)]
#[command(name = "recsync", version, about)]
pub struct Cli {
    /// Input files or directories of line-delimited JSON records
    #[arg(value_name = "FILE", required = true)]
    pub sources: Vec<PathBuf>,

    /// Optional YAML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Record category of the inputs
    #[arg(long, value_enum)]
    pub record_type: Option<RecordCategory>,

    /// Gateway base URL
    #[arg(long, env = "SYNC_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Tenant identifier
    #[arg(long, env = "SYNC_TENANT")]
    pub tenant: Option<String>,

    /// Username to log in with
    #[arg(long, env = "SYNC_USERNAME")]
    pub username: Option<String>,

    /// Password (prefer the environment variable)
    #[arg(long, env = "SYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Records per submitted batch (1-1000)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Concurrent batch workers
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Create-or-update instead of create-only
    #[arg(long)]
    pub upsert: bool,

    /// Keep existing statistical code lists, unioned with incoming ones
    #[arg(long)]
    pub preserve_statistical_codes: bool,

    /// Keep existing administrative note lists, unioned with incoming ones
    #[arg(long)]
    pub preserve_administrative_notes: bool,

    /// Keep existing temporary location and loan type values verbatim
    #[arg(long)]
    pub preserve_temporary_locations: bool,

    /// Let the incoming status win instead of keeping the existing one
    #[arg(long)]
    pub update_status: bool,

    /// Update only this field path, leaving the rest of existing records
    /// untouched (repeatable; enables patch mode)
    #[arg(long = "patch-path", value_name = "PATH")]
    pub patch_paths: Vec<String>,

    /// Write terminally failed records to this file
    #[arg(long, value_name = "PATH")]
    pub failed_records_file: Option<PathBuf>,

    /// Maximum submission attempts per batch
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Exit zero even when records failed
    #[arg(long)]
    pub no_fail_on_errors: bool,
}

impl Cli {
    /// Resolve the final job configuration: file, then flags, then validate.
    pub async fn into_config(self) -> Result<JobConfig> {
        let mut config = match &self.config {
            Some(path) => JobConfig::from_file(path).await?,
            None => JobConfig::default(),
        };

        if !self.sources.is_empty() {
            config.sources = self.sources;
        }
        if let Some(record_type) = self.record_type {
            config.record_type = Some(record_type);
        }
        if let Some(url) = self.gateway_url {
            config.gateway.base_url = url;
        }
        if let Some(tenant) = self.tenant {
            config.gateway.tenant = tenant;
        }
        if let Some(username) = self.username {
            config.gateway.username = username;
        }
        if let Some(password) = self.password {
            config.gateway.password = password;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.upsert {
            config.upsert = true;
        }
        if self.preserve_statistical_codes {
            config.merge.preserve_statistical_codes = true;
        }
        if self.preserve_administrative_notes {
            config.merge.preserve_administrative_notes = true;
        }
        if self.preserve_temporary_locations {
            config.merge.preserve_temporary_locations = true;
        }
        if self.update_status {
            config.merge.update_status = true;
        }
        if !self.patch_paths.is_empty() {
            config.merge.patch_existing_records = true;
            config.merge.patch_paths = self.patch_paths;
        }
        if let Some(path) = self.failed_records_file {
            config.failed_records_file = Some(path);
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if self.no_fail_on_errors {
            config.fail_on_errors = false;
        }

        config.validate()?;
        Ok(config)
    }
}
