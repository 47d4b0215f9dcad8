//! Configuration for the log retrieval pipeline.
//!
//! All structs deserialize with serde and fill missing fields from their
//! `Default` impls, so a partial document such as
//! `{"workspace_id": "..."}` is a complete configuration. Loading the document
//! (files, environment, secret stores) is left to the caller.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};
use crate::types::{MAX_TIME_RANGE_DAYS, Severity};

/// Audience requested from the identity service.
pub const LOG_ANALYTICS_SCOPE: &str = "https://api.loganalytics.io/.default";

/// Default log query endpoint.
pub const DEFAULT_QUERY_ENDPOINT: &str = "https://api.loganalytics.io";

/// Default identity authority.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Lower bound for `query_timeout_ms`.
pub const MIN_QUERY_TIMEOUT_MS: u64 = 1_000;
/// Upper bound for `query_timeout_ms`.
pub const MAX_QUERY_TIMEOUT_MS: u64 = 300_000;
/// Upper bound for `batch_size`.
pub const MAX_BATCH_SIZE: u32 = 10_000;
/// Upper bound for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;
/// Upper bound for `lookback_minutes`, the longest span a query may cover.
pub const MAX_LOOKBACK_MINUTES: u32 = (MAX_TIME_RANGE_DAYS * 24 * 60) as u32;
/// Lower bound for `reset_timeout_ms`.
pub const MIN_RESET_TIMEOUT_MS: u64 = 1_000;

/// Top-level configuration for a [`LogFetcher`](crate::LogFetcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Log Analytics workspace identifier
    pub workspace_id: String,
    /// Server-side query timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Default lookback window when no time range is given
    pub lookback_minutes: u32,
    /// Maximum rows per query
    pub batch_size: u32,
    /// Tables unioned by the query
    pub source_tables: Vec<String>,
    /// Severity names to include; the least severe one sets the threshold
    pub severity_levels: Vec<String>,
    /// Retry behavior
    pub retry: RetryConfig,
    /// Circuit breaker behavior
    pub circuit_breaker: CircuitBreakerConfig,
    /// Timeout recovery bounds
    pub narrowing: NarrowingConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workspace_id: String::new(),
            query_timeout_ms: 30_000,
            lookback_minutes: 15,
            batch_size: 1_000,
            source_tables: vec!["traces".to_string(), "exceptions".to_string()],
            severity_levels: vec![
                Severity::Warning.as_str().to_string(),
                Severity::Error.as_str().to_string(),
                Severity::Critical.as_str().to_string(),
            ],
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            narrowing: NarrowingConfig::default(),
        }
    }
}

impl FetcherConfig {
    /// Creates a default configuration for the given workspace.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            ..Self::default()
        }
    }

    /// Returns the query timeout as a [`Duration`].
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Checks every field, including nested retry and breaker settings.
    pub fn validate(&self) -> Result<()> {
        validate_workspace_id(&self.workspace_id)?;
        if !(MIN_QUERY_TIMEOUT_MS..=MAX_QUERY_TIMEOUT_MS).contains(&self.query_timeout_ms) {
            return Err(FetchError::InvalidConfig(format!(
                "query_timeout_ms must be between {MIN_QUERY_TIMEOUT_MS} and {MAX_QUERY_TIMEOUT_MS}, got {}",
                self.query_timeout_ms
            )));
        }
        if !(1..=MAX_LOOKBACK_MINUTES).contains(&self.lookback_minutes) {
            return Err(FetchError::InvalidConfig(format!(
                "lookback_minutes must be between 1 and {MAX_LOOKBACK_MINUTES}, got {}",
                self.lookback_minutes
            )));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(FetchError::InvalidConfig(format!(
                "batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.source_tables.is_empty() {
            return Err(FetchError::InvalidConfig(
                "source_tables must name at least one table".to_string(),
            ));
        }
        if let Some(bad) = self.source_tables.iter().find(|t| !is_identifier(t)) {
            return Err(FetchError::InvalidConfig(format!(
                "source table {bad:?} is not a valid identifier"
            )));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.narrowing.validate()
    }
}

/// Rejects empty or whitespace-only workspace identifiers.
pub fn validate_workspace_id(workspace_id: &str) -> Result<()> {
    if workspace_id.trim().is_empty() {
        return Err(FetchError::InvalidConfig(
            "workspace_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any computed backoff
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
    /// Consecutive 429s before a warning is raised
    pub rate_limit_alert_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            rate_limit_alert_threshold: 3,
        }
    }
}

impl RetryConfig {
    /// Checks bounds on retry settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(FetchError::InvalidConfig(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.max_retries
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(FetchError::InvalidConfig(format!(
                "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(FetchError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Returns the reset timeout as a [`Duration`].
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks bounds on breaker settings.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold < 1 {
            return Err(FetchError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.reset_timeout_ms < MIN_RESET_TIMEOUT_MS {
            return Err(FetchError::InvalidConfig(format!(
                "reset_timeout_ms must be at least {MIN_RESET_TIMEOUT_MS}, got {}",
                self.reset_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Bounds on halving the time window after a query timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrowingConfig {
    /// How many times one fetch may halve its window
    pub max_narrowings: u32,
    /// Windows are never narrowed below this many seconds
    pub min_window_secs: u64,
}

impl Default for NarrowingConfig {
    fn default() -> Self {
        Self {
            max_narrowings: 6,
            min_window_secs: 60,
        }
    }
}

impl NarrowingConfig {
    /// Checks narrowing bounds.
    pub fn validate(&self) -> Result<()> {
        if self.min_window_secs == 0 {
            return Err(FetchError::InvalidConfig(
                "narrowing.min_window_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Service principal credentials for the OAuth2 client-credentials grant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Directory (tenant) identifier
    pub tenant_id: String,
    /// Application (client) identifier
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Identity authority base URL
    pub authority_host: String,
    /// Log query service base URL
    pub query_endpoint: String,
    /// Token acquisition attempts before giving up
    pub max_attempts: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            query_endpoint: DEFAULT_QUERY_ENDPOINT.to_string(),
            max_attempts: 3,
        }
    }
}

impl CredentialConfig {
    /// Checks that the identity fields are present.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(FetchError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if self.max_attempts < 1 {
            return Err(FetchError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authority_host", &self.authority_host)
            .field("query_endpoint", &self.query_endpoint)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
