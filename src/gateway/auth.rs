//! Authentication token lifecycle
//!
//! The session token is process-wide state with an explicit lifecycle:
//! acquired at job start, refreshed on expiry, torn down with the job. It
//! is owned by a [`TokenManager`] passed by `Arc` to workers; refreshes are
//! single-flight: workers that find the token stale block on one in-flight
//! login instead of issuing duplicates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, SyncError};

/// Header carrying the tenant identifier
pub const TENANT_HEADER: &str = "x-okapi-tenant";
/// Header carrying the session token
pub const TOKEN_HEADER: &str = "x-okapi-token";

const LOGIN_PATH: &str = "/authn/login";

/// Slack subtracted from the token lifetime so workers refresh before the
/// service starts rejecting
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Login credentials for the record-storage service
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Tenant identifier
    pub tenant: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

#[derive(Debug, Clone)]
struct TokenState {
    token: String,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    fn is_fresh(&self) -> bool {
        self.expires_at > Utc::now() + ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Owns the session token and serializes refreshes
pub struct TokenManager {
    client: Client,
    base_url: Url,
    credentials: Credentials,
    token_ttl_secs: i64,
    state: RwLock<Option<TokenState>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    /// Create a manager; no network traffic until [`acquire`](Self::acquire)
    /// or the first [`token`](Self::token) call.
    pub fn new(client: Client, base_url: Url, credentials: Credentials, token_ttl_secs: u64) -> Self {
        Self {
            client,
            base_url,
            credentials,
            token_ttl_secs: token_ttl_secs as i64,
            state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Tenant the session belongs to
    pub fn tenant(&self) -> &str {
        &self.credentials.tenant
    }

    /// Log in at job start. Failure here is fatal.
    pub async fn acquire(&self) -> Result<()> {
        self.refresh().await?;
        info!(tenant = %self.credentials.tenant, "session established");
        Ok(())
    }

    /// Current token, refreshing first if it is stale.
    pub async fn token(&self) -> Result<String> {
        if let Some(state) = self.state.read().await.as_ref() {
            if state.is_fresh() {
                return Ok(state.token.clone());
            }
        }
        self.refresh().await
    }

    /// Refresh the token, single-flight: concurrent callers wait for one
    /// login and reuse its result.
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        // another worker may have refreshed while we waited for the lock
        if let Some(state) = self.state.read().await.as_ref() {
            if state.is_fresh() {
                return Ok(state.token.clone());
            }
        }
        let state = self.login().await?;
        let token = state.token.clone();
        *self.state.write().await = Some(state);
        Ok(token)
    }

    /// Replace a token the service just rejected, regardless of its local
    /// expiry bookkeeping. Single-flight: if another worker already swapped
    /// the rejected token out, its replacement is reused.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(state) = self.state.read().await.as_ref() {
            if state.token != rejected {
                return Ok(state.token.clone());
            }
        }
        let state = self.login().await?;
        let token = state.token.clone();
        *self.state.write().await = Some(state);
        Ok(token)
    }

    async fn login(&self) -> Result<TokenState> {
        let url = join_path(&self.base_url, LOGIN_PATH)?;
        debug!(%url, username = %self.credentials.username, "logging in");

        let response = self
            .client
            .post(url)
            .header(TENANT_HEADER, &self.credentials.tenant)
            .json(&json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            }))
            .send()
            .await
            .map_err(|err| SyncError::fatal(format!("login request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::fatal(format!(
                "authentication failed for user '{}' (status {status})",
                self.credentials.username
            )));
        }

        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| SyncError::fatal("login response carried no session token"))?;

        Ok(TokenState {
            token,
            expires_at: Utc::now() + ChronoDuration::seconds(self.token_ttl_secs),
        })
    }
}

pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    {
        let trimmed_base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{trimmed_base}{path}"));
    }
    Ok(url)
}
