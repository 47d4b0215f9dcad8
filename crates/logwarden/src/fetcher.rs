//! The fetch orchestrator.
//!
//! [`LogFetcher`] composes credentials, query construction, the circuit
//! breaker, the retry executor and the response parser into
//! [`LogFetcher::fetch_logs`]. A query that times out is repeated over the
//! first half of its window until it succeeds or the narrowing bounds are hit.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::client::{HttpLogQueryClient, LogQueryClient, QueryRequest, QueryResponse, QueryStatus};
use crate::config::{CredentialConfig, FetcherConfig};
use crate::credential::{ClientSecretTokenSource, Credential, CredentialProvider, TokenSource};
use crate::error::{FetchError, Result, ServiceError};
use crate::parser::ResponseParser;
use crate::query::{parse_continuation_token, QueryBuilder};
use crate::retry::{RateLimitAlert, RetryExecutor};
use crate::types::{format_cursor, QueryResult, Row, TimeRange};

/// Token acquisition attempts used by [`LogFetcher::new`].
pub const DEFAULT_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Column returned by `| count`.
const COUNT_COLUMN: &str = "Count";

/// Retrieves logs from one workspace.
#[derive(Debug)]
pub struct LogFetcher<C, S> {
    config: FetcherConfig,
    client: C,
    credentials: CredentialProvider<S>,
    query_builder: QueryBuilder,
    parser: ResponseParser,
    retry: RetryExecutor,
    breaker: CircuitBreaker,
    initialized: AtomicBool,
}

impl LogFetcher<HttpLogQueryClient, ClientSecretTokenSource> {
    /// Creates a fetcher talking HTTPS to the configured endpoints.
    pub fn connect(config: FetcherConfig, credentials: &CredentialConfig) -> Result<Self> {
        config.validate()?;
        let client = HttpLogQueryClient::new(credentials.query_endpoint.clone())?;
        let source = ClientSecretTokenSource::new(credentials)?;
        Self::build(config, client, source, credentials.max_attempts)
    }
}

impl<C: LogQueryClient, S: TokenSource> LogFetcher<C, S> {
    /// Creates a fetcher. The configuration is validated before anything
    /// touches the network.
    pub fn new(config: FetcherConfig, client: C, token_source: S) -> Result<Self> {
        Self::build(config, client, token_source, DEFAULT_CREDENTIAL_ATTEMPTS)
    }

    fn build(config: FetcherConfig, client: C, token_source: S, attempts: u32) -> Result<Self> {
        config.validate()?;
        let credentials =
            CredentialProvider::new(config.workspace_id.clone(), token_source, attempts)?;
        Ok(Self {
            query_builder: QueryBuilder::from_config(&config),
            parser: ResponseParser::new(),
            retry: RetryExecutor::new(config.retry.clone())?,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone())?,
            initialized: AtomicBool::new(false),
            credentials,
            client,
            config,
        })
    }

    /// Installs a hook called when rate limiting persists.
    #[must_use]
    pub fn with_rate_limit_alert(mut self, hook: RateLimitAlert) -> Self {
        self.retry = self.retry.with_rate_limit_alert(hook);
        self
    }

    /// Acquires credentials. Must succeed before fetching.
    pub async fn initialize(&self) -> Result<()> {
        self.credentials.authenticate().await?;
        self.initialized.store(true, Ordering::Release);
        info!(workspace_id = %self.config.workspace_id, "log fetcher initialized");
        Ok(())
    }

    /// Fetches the newest entries in `range`, or in the configured lookback
    /// window when `range` is `None`.
    pub async fn fetch_logs(&self, range: Option<TimeRange>) -> Result<QueryResult> {
        self.fetch_page(range, None).await
    }

    /// Fetches one page, resuming below `continuation` when given.
    pub async fn fetch_page(
        &self,
        range: Option<TimeRange>,
        continuation: Option<&str>,
    ) -> Result<QueryResult> {
        self.ensure_initialized()?;
        let requested = range.unwrap_or_else(|| self.default_range());
        requested.validate()?;
        if let Some(token) = continuation {
            parse_continuation_token(token)?;
        }

        let mut window = requested;
        let mut narrowings: u32 = 0;
        loop {
            let attempt = self
                .guarded(move || self.run_query(window, continuation))
                .await;
            let err = match attempt {
                Ok(result) => return Ok(result),
                Err(err) if err.is_timeout() => err,
                Err(err) => return Err(err),
            };

            let Some(next) = self.narrow(&window, narrowings) else {
                warn!(
                    window = %window,
                    narrowings,
                    error = %err,
                    "query timed out and the window cannot be narrowed further"
                );
                return Err(err);
            };
            narrowings += 1;
            warn!(
                from = %window,
                to = %next,
                narrowings,
                "query timed out, retrying over a narrower window"
            );
            window = next;
        }
    }

    /// Counts matching entries in `range` (or the lookback window).
    pub async fn count_logs(&self, range: Option<TimeRange>) -> Result<u64> {
        self.ensure_initialized()?;
        let window = range.unwrap_or_else(|| self.default_range());
        window.validate()?;
        self.guarded(move || self.run_count(window)).await
    }

    /// Snapshot of the circuit breaker.
    #[must_use]
    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    /// Forces the circuit breaker closed.
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Rate-limited responses seen since the last success.
    #[must_use]
    pub fn consecutive_rate_limits(&self) -> u32 {
        self.retry.consecutive_rate_limits()
    }

    /// True once [`LogFetcher::initialize`] has succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(FetchError::NotInitialized)
        }
    }

    fn default_range(&self) -> TimeRange {
        TimeRange::last_minutes(Utc::now(), self.config.lookback_minutes)
    }

    /// Halves `window` unless a narrowing bound would be crossed.
    fn narrow(&self, window: &TimeRange, narrowings: u32) -> Option<TimeRange> {
        let bounds = &self.config.narrowing;
        if narrowings >= bounds.max_narrowings {
            return None;
        }
        let next = window.narrowed(2).ok()?;
        let min_window = chrono::Duration::seconds(i64::try_from(bounds.min_window_secs).ok()?);
        (next.duration() >= min_window).then_some(next)
    }

    /// Runs `operation` under the circuit breaker and retry executor.
    async fn guarded<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.breaker
            .execute(|| self.retry.execute_with_retry(operation))
            .await
    }

    async fn run_query(&self, window: TimeRange, continuation: Option<&str>) -> Result<QueryResult> {
        let started = Instant::now();
        let query = self.query_builder.build_query(&window, continuation)?;
        debug!(window = %window, %query, "running log query");

        let response = self.execute(query, window).await?;
        let (rows, partial_error) = response_rows(&response)?;
        let outcome = self.parser.parse_rows(&rows);
        if outcome.failed_count > 0 {
            warn!(
                failed = outcome.failed_count,
                total = outcome.total_count,
                "some rows could not be parsed"
            );
        }

        let has_more = outcome.entries.len() >= self.query_builder.batch_size() as usize;
        let continuation_token = if has_more {
            outcome
                .entries
                .iter()
                .map(|e| e.timestamp)
                .min()
                .map(format_cursor)
        } else {
            None
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            entries = outcome.entries.len(),
            failed = outcome.failed_count,
            has_more,
            duration_ms,
            request_id = response.request_id.as_deref().unwrap_or(""),
            "fetched logs"
        );

        Ok(QueryResult {
            entries: outcome.entries,
            total_count: outcome.total_count,
            failed_count: outcome.failed_count,
            has_more,
            continuation_token,
            duration_ms,
            request_id: response.request_id,
            time_range: window,
            partial_error,
        })
    }

    async fn run_count(&self, window: TimeRange) -> Result<u64> {
        let query = self.query_builder.build_count_query(&window)?;
        let response = self.execute(query, window).await?;
        let (rows, _) = response_rows(&response)?;
        let Some(row) = rows.first() else {
            return Ok(0);
        };
        count_from_row(row).ok_or_else(|| {
            FetchError::QueryExecution(ServiceError::new(
                "count query returned no numeric value",
            ))
        })
    }

    async fn execute(&self, query: String, window: TimeRange) -> Result<QueryResponse> {
        let credential = self.current_credential().await?;
        let request = QueryRequest {
            workspace_id: self.config.workspace_id.clone(),
            query,
            timespan: window,
            server_timeout: self.config.query_timeout(),
        };

        self.client
            .query_workspace(&request, credential.token())
            .await
            .inspect_err(|err| {
                if err.service_error().and_then(|e| e.status) == Some(401) {
                    warn!("log service rejected the credential; clearing cache");
                    self.credentials.reset();
                }
            })
    }

    async fn current_credential(&self) -> Result<Credential> {
        let credential = self.credentials.authenticate().await?;
        if !credential.is_expired(Utc::now()) {
            return Ok(credential);
        }
        info!(expires_at = %credential.token().expires_at(), "credential expiring, refreshing");
        self.credentials.reset();
        self.credentials.authenticate().await
    }
}

/// Picks rows out of a response according to its status.
///
/// A partial failure with rows yields the rows and the failure message; one
/// without rows is an error.
fn response_rows(response: &QueryResponse) -> Result<(Vec<Row>, Option<String>)> {
    match response.status {
        QueryStatus::Success => Ok((response.primary_rows(), None)),
        QueryStatus::PartialFailure => {
            let message = response
                .partial_error
                .clone()
                .unwrap_or_else(|| "query partially failed".to_string());
            let rows = response.primary_rows();
            if rows.is_empty() {
                return Err(FetchError::QueryExecution(ServiceError::new(message)));
            }
            warn!(rows = rows.len(), error = %message, "query returned partial results");
            Ok((rows, Some(message)))
        }
        QueryStatus::Other(ref status) => Err(FetchError::QueryExecution(ServiceError::new(
            format!("unexpected query status: {status}"),
        ))),
    }
}

fn count_from_row(row: &Row) -> Option<u64> {
    let as_count = |v: &Value| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    row.get(COUNT_COLUMN)
        .and_then(as_count)
        .or_else(|| row.values().find_map(as_count))
}
