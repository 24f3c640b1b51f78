//! # recsync
//!
//! Bulk record synchronization engine: reads line-delimited JSON record
//! sets and reconciles them against a remote record-storage service's batch
//! create/update endpoints under optimistic concurrency control.
//!
//! ## Features
//!
//! - **Batch upsert**: existing records are matched by identifier, merged
//!   field by field under configurable preservation rules, and updated with
//!   the version token observed at resolution time.
//! - **Patch-path mode**: restrict updates to an explicit allow-list of
//!   field paths, leaving every other field untouched.
//! - **Bounded concurrency**: a fixed pool of workers submits batches in
//!   parallel; transient failures retry whole batches with exponential
//!   backoff.
//! - **Complete accounting**: every input record ends in exactly one bucket
//!   (created, updated, conflicted, transient-failed, rejected) and failed
//!   records land in a line-delimited failure sink ready for resubmission.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recsync::config::JobConfig;
//! use recsync::core::job::SyncJob;
//! use recsync::gateway::HttpGateway;
//! use recsync::progress::LogProgress;
//!
//! # async fn run(config: JobConfig, gateway: HttpGateway) -> recsync::Result<()> {
//! let job = SyncJob::new(config, Arc::new(gateway), Arc::new(LogProgress::new()));
//! let report = job.run().await?;
//! println!("created {}, updated {}", report.summary.created, report.summary.updated);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod progress;

// Re-export main types
pub use config::JobConfig;
pub use core::job::{JobReport, SyncJob};
pub use error::{Result, SyncError};
