//! recsync - bulk record synchronization CLI
//!
//! Thin wrapper over the library: parse flags, establish a session, run the
//! job, render the summary, map the outcome to an exit code.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use recsync::cli::Cli;
use recsync::core::job::SyncJob;
use recsync::gateway::http::build_client;
use recsync::gateway::{Credentials, HttpGateway, HttpGatewayConfig, TokenManager};
use recsync::progress::LogProgress;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging system
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            // Display (not Debug) keeps the error chain readable
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.into_config().await.context("invalid configuration")?;
    let fail_on_errors = config.fail_on_errors;

    let base_url = config.gateway.url()?;
    let client = build_client(Duration::from_secs(config.gateway.timeout_secs))?;
    let tokens = Arc::new(TokenManager::new(
        client.clone(),
        base_url.clone(),
        Credentials {
            tenant: config.gateway.tenant.clone(),
            username: config.gateway.username.clone(),
            password: config.gateway.password.clone(),
        },
        config.gateway.token_ttl_secs,
    ));
    tokens
        .acquire()
        .await
        .context("failed to establish a session")?;

    let gateway = HttpGateway::new(
        client,
        HttpGatewayConfig {
            base_url,
            timeout: Duration::from_secs(config.gateway.timeout_secs),
            identifier_field: config.identifier_field.clone(),
        },
        tokens,
    );

    let job = SyncJob::new(config, Arc::new(gateway), Arc::new(LogProgress::new()));
    let stop = job.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested; letting in-flight batches drain");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let report = job.run().await?;
    if let Some(fatal) = &report.fatal {
        eprintln!("Job aborted: {fatal}");
        return Ok(ExitCode::FAILURE);
    }
    if fail_on_errors && report.summary.failed() > 0 {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}
