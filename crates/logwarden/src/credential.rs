//! Credential acquisition and caching.
//!
//! This module provides:
//! - [`TokenSource`] — the seam to an identity service
//! - [`ClientSecretTokenSource`] — OAuth2 client-credentials over HTTPS
//! - [`CredentialProvider`] — caches one [`Credential`] and retries
//!   acquisition with exponential backoff

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{collect_headers, map_transport_error};
use crate::config::{validate_workspace_id, CredentialConfig, LOG_ANALYTICS_SCOPE};
use crate::error::{FetchError, Result, ServiceError};

/// Minutes before expiry at which a token is treated as expired.
pub const EXPIRY_SKEW_MINUTES: i64 = 5;

/// First acquisition retry delay.
const INITIAL_BACKOFF_MS: u64 = 1_000;
/// Cap on acquisition retry delay.
const MAX_BACKOFF_MS: u64 = 10_000;

/// A bearer token and its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Creates a token.
    #[must_use]
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// The bearer string.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// When the token stops being accepted.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues access tokens for a scope.
pub trait TokenSource: Send + Sync {
    /// Requests a token valid for `scope`.
    fn get_token(&self, scope: &str) -> impl Future<Output = Result<AccessToken>> + Send;
}

/// A validated credential held by [`CredentialProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: AccessToken,
    acquired_at: DateTime<Utc>,
}

impl Credential {
    /// Wraps a token acquired at `acquired_at`.
    #[must_use]
    pub const fn new(token: AccessToken, acquired_at: DateTime<Utc>) -> Self {
        Self { token, acquired_at }
    }

    /// The access token.
    #[must_use]
    pub const fn token(&self) -> &AccessToken {
        &self.token
    }

    /// When the credential was acquired.
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// True when the token expires within [`EXPIRY_SKEW_MINUTES`] of `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token.expires_at <= now + chrono::Duration::minutes(EXPIRY_SKEW_MINUTES)
    }
}

/// Acquires and caches the credential for one workspace.
pub struct CredentialProvider<S> {
    workspace_id: String,
    source: S,
    max_attempts: u32,
    cached: Mutex<Option<Credential>>,
}

impl<S> fmt::Debug for CredentialProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("workspace_id", &self.workspace_id)
            .field("max_attempts", &self.max_attempts)
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl<S> CredentialProvider<S> {
    /// Drops the cached credential so the next call re-acquires.
    pub fn reset(&self) {
        if self.cached.lock().take().is_some() {
            debug!(workspace_id = %self.workspace_id, "credential cache cleared");
        }
    }

    /// True when a credential is cached.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// The workspace this provider authenticates for.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

impl<S: TokenSource> CredentialProvider<S> {
    /// Creates a provider. Fails when `workspace_id` is blank or
    /// `max_attempts` is zero.
    pub fn new(workspace_id: impl Into<String>, source: S, max_attempts: u32) -> Result<Self> {
        let workspace_id = workspace_id.into();
        validate_workspace_id(&workspace_id)?;
        if max_attempts < 1 {
            return Err(FetchError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            workspace_id,
            source,
            max_attempts,
            cached: Mutex::new(None),
        })
    }

    /// Returns the cached credential, acquiring one if needed.
    pub async fn authenticate(&self) -> Result<Credential> {
        let cached = self.cached.lock().clone();
        if let Some(credential) = cached {
            return Ok(credential);
        }

        let mut attempt: u32 = 1;
        loop {
            match self.acquire().await {
                Ok(credential) => {
                    info!(
                        workspace_id = %self.workspace_id,
                        attempt,
                        expires_at = %credential.token.expires_at,
                        "acquired log service credential"
                    );
                    *self.cached.lock() = Some(credential.clone());
                    return Ok(credential);
                }
                Err(err) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %err, "credential acquisition failed");
                    let source = err
                        .service_error()
                        .cloned()
                        .unwrap_or_else(|| ServiceError::new(err.to_string()));
                    return Err(FetchError::Authentication {
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    let delay = acquisition_backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "credential acquisition failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn acquire(&self) -> Result<Credential> {
        let token = self.source.get_token(LOG_ANALYTICS_SCOPE).await?;
        if token.secret().trim().is_empty() {
            return Err(FetchError::QueryExecution(ServiceError::new(
                "identity service returned an empty access token",
            )));
        }
        Ok(Credential::new(token, Utc::now()))
    }
}

/// Delay before acquisition retry `attempt` (1-based).
#[must_use]
pub fn acquisition_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((INITIAL_BACKOFF_MS << exp).min(MAX_BACKOFF_MS))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 client-credentials token source.
#[derive(Clone)]
pub struct ClientSecretTokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl fmt::Debug for ClientSecretTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretTokenSource")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ClientSecretTokenSource {
    /// Creates a token source from validated credentials.
    pub fn new(config: &CredentialConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("logwarden/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Self::with_http_client(http, config)
    }

    /// Creates a token source reusing an existing `reqwest::Client`.
    pub fn with_http_client(http: reqwest::Client, config: &CredentialConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                config.authority_host.trim_end_matches('/'),
                config.tenant_id.trim()
            ),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

impl TokenSource for ClientSecretTokenSource {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        debug!(token_url = %self.token_url, scope, "requesting access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.text().await.map_err(map_transport_error)?;

        if !(200..300).contains(&status) {
            let parsed: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            let message = parsed
                .error_description
                .or_else(|| parsed.error.clone())
                .unwrap_or_else(|| format!("identity service returned HTTP {status}"));
            return Err(FetchError::QueryExecution(ServiceError {
                status: Some(status),
                code: parsed.error,
                network: None,
                message,
                headers,
            }));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            FetchError::QueryExecution(ServiceError::http(
                status,
                format!("malformed token response: {e}"),
            ))
        })?;
        let expires_in = parsed
            .expires_in
            .as_ref()
            .and_then(expires_in_secs)
            .unwrap_or(3_600)
            .clamp(0, i64::from(u32::MAX));
        Ok(AccessToken::new(
            parsed.access_token,
            Utc::now() + chrono::Duration::seconds(expires_in),
        ))
    }
}

/// Reads `expires_in`, which identity services send as a number or a string.
fn expires_in_secs(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
