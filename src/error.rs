//! Error handling for the synchronization engine
//!
//! One taxonomy covers the whole job lifecycle. The variants map directly to
//! how the engine recovers:
//!
//! - `Validation`: a single record is unusable; it is rejected and the job
//!   continues.
//! - `Conflict`: the remote copy moved since resolution; the record fails
//!   without retry and the job continues.
//! - `Transient`: timeouts and server-side failures; the affected batch is
//!   retried with backoff up to the configured ceiling.
//! - `Fatal` / `Config` / `Io`: the job aborts after in-flight batches drain.

use thiserror::Error;

/// Result type alias for the synchronization engine
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for the synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record-level shape validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-locking version conflict
    #[error("Version conflict for record {id} (expected version {expected_version})")]
    Conflict {
        /// Identifier of the conflicting record
        id: String,
        /// Version token the update carried
        expected_version: i64,
    },

    /// Recoverable errors: timeouts, connection failures, 5xx responses
    #[error("Transient error: {0}")]
    Transient(String),

    /// Unrecoverable errors that abort the whole job
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// IO errors (input sources, failure sink)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a record validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Create a version conflict error
    pub fn conflict(id: impl Into<String>, expected_version: i64) -> Self {
        Self::Conflict {
            id: id.into(),
            expected_version,
        }
    }

    /// Whether a batch that failed with this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this error aborts the whole job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal(_) | Self::Config(_) | Self::Io(_) | Self::Yaml(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::Transient(format!("HTTP request failed: {err}"));
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return Self::Transient(format!("server error {status}: {err}"));
            }
            return Self::Fatal(format!("HTTP error {status}: {err}"));
        }
        // Connection resets and other mid-flight failures without a status
        Self::Transient(format!("HTTP request failed: {err}"))
    }
}
