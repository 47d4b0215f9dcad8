//! Client for the log query service.
//!
//! [`LogQueryClient`] is the seam the fetcher talks through;
//! [`HttpLogQueryClient`] implements it against the Log Analytics query REST
//! API (`POST /v1/workspaces/{id}/query`).

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::credential::AccessToken;
use crate::error::{FetchError, NetworkFailure, Result, ServiceError};
use crate::retry::RETRYABLE_STATUS_CODES;
use crate::types::{Row, TimeRange};

/// Extra time the HTTP client waits beyond the server-side timeout.
pub const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Headers that may carry the service request identifier.
const REQUEST_ID_HEADERS: [&str; 2] = ["x-ms-request-id", "request-id"];

/// A column descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Service type name (e.g. `datetime`, `string`, `dynamic`)
    #[serde(rename = "type", default)]
    pub column_type: String,
}

/// A result table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name (`PrimaryResult` for the main result)
    #[serde(default)]
    pub name: String,
    /// Column descriptors, in row order
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Row values, positionally matching `columns`
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Zips column names with each row.
    ///
    /// Missing trailing values are left out of the row; surplus values are
    /// dropped.
    #[must_use]
    pub fn to_rows(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|values| {
                self.columns
                    .iter()
                    .zip(values)
                    .map(|(col, value)| (col.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

/// Outcome reported by the service for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// All rows returned.
    Success,
    /// Some rows returned alongside an error.
    PartialFailure,
    /// Anything else, with a description.
    Other(String),
}

/// A query to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Workspace to query
    pub workspace_id: String,
    /// KQL text
    pub query: String,
    /// Time span applied by the service in addition to the query's filter
    pub timespan: TimeRange,
    /// Server-side execution limit
    pub server_timeout: Duration,
}

/// The service's answer to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    /// Outcome
    pub status: QueryStatus,
    /// Tables of a successful query
    pub tables: Vec<Table>,
    /// Tables returned with a partial failure
    pub partial_tables: Vec<Table>,
    /// Partial failure description
    pub partial_error: Option<String>,
    /// Service request identifier
    pub request_id: Option<String>,
}

impl QueryResponse {
    /// A successful response with one primary table.
    #[must_use]
    pub fn success(table: Table) -> Self {
        Self {
            status: QueryStatus::Success,
            tables: vec![table],
            partial_tables: Vec::new(),
            partial_error: None,
            request_id: None,
        }
    }

    /// A partial failure with whatever rows were produced.
    #[must_use]
    pub fn partial(table: Table, error: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::PartialFailure,
            tables: Vec::new(),
            partial_tables: vec![table],
            partial_error: Some(error.into()),
            request_id: None,
        }
    }

    /// Sets the request identifier.
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Rows of the primary table from whichever table set is populated.
    #[must_use]
    pub fn primary_rows(&self) -> Vec<Row> {
        let tables = if self.tables.is_empty() {
            &self.partial_tables
        } else {
            &self.tables
        };
        tables.first().map(Table::to_rows).unwrap_or_default()
    }
}

/// Executes queries against a log service.
pub trait LogQueryClient: Send + Sync {
    /// Runs `request` with the given bearer token.
    fn query_workspace(
        &self,
        request: &QueryRequest,
        token: &AccessToken,
    ) -> impl Future<Output = Result<QueryResponse>> + Send;
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    tables: Vec<Table>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    innererror: Option<Box<WireError>>,
}

impl WireError {
    /// Joins messages from the error chain, outermost first.
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        let mut current = Some(self);
        while let Some(e) = current {
            if let Some(ref m) = e.message {
                parts.push(m.clone());
            } else if let Some(ref c) = e.code {
                parts.push(c.clone());
            }
            current = e.innererror.as_deref();
        }
        parts.join(": ")
    }
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireError,
}

/// Log Analytics query client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpLogQueryClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLogQueryClient {
    /// Creates a client for the given base endpoint
    /// (e.g. `https://api.loganalytics.io`).
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("logwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(http, endpoint))
    }

    /// Creates a client reusing an existing `reqwest::Client`.
    #[must_use]
    pub fn with_http_client(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn query_url(&self, workspace_id: &str) -> String {
        format!("{}/v1/workspaces/{}/query", self.endpoint, workspace_id.trim())
    }
}

impl LogQueryClient for HttpLogQueryClient {
    async fn query_workspace(
        &self,
        request: &QueryRequest,
        token: &AccessToken,
    ) -> Result<QueryResponse> {
        let url = self.query_url(&request.workspace_id);
        let wait_secs = request.server_timeout.as_secs().max(1);
        debug!(%url, timespan = %request.timespan, wait_secs, "executing log query");

        let response = self
            .http
            .post(&url)
            .bearer_auth(token.secret())
            .header("Prefer", format!("wait={wait_secs}"))
            .timeout(request.server_timeout + CLIENT_TIMEOUT_SLACK)
            .json(&json!({
                "query": request.query,
                "timespan": request.timespan.to_iso_interval(),
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let request_id = REQUEST_ID_HEADERS
            .iter()
            .find_map(|name| headers.get(*name).cloned());
        let body = response.text().await.map_err(map_transport_error)?;

        if !(200..300).contains(&status) {
            return Err(error_for_status(status, &body, headers));
        }

        let wire: WireResponse = serde_json::from_str(&body).map_err(|e| {
            FetchError::QueryExecution(ServiceError::http(
                status,
                format!("malformed query response: {e}"),
            ))
        })?;

        Ok(match wire.error {
            None => QueryResponse {
                status: QueryStatus::Success,
                tables: wire.tables,
                partial_tables: Vec::new(),
                partial_error: None,
                request_id,
            },
            Some(err) => QueryResponse {
                status: QueryStatus::PartialFailure,
                tables: Vec::new(),
                partial_tables: wire.tables,
                partial_error: Some(err.describe()),
                request_id,
            },
        })
    }
}

/// Lower-cases header names and keeps UTF-8 values.
pub(crate) fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Builds the pipeline error for a non-2xx response.
pub(crate) fn error_for_status(
    status: u16,
    body: &str,
    headers: HashMap<String, String>,
) -> FetchError {
    let (code, message) = match serde_json::from_str::<WireErrorBody>(body) {
        Ok(parsed) => (parsed.error.code.clone(), parsed.error.describe()),
        Err(_) if body.trim().is_empty() => (None, format!("HTTP {status}")),
        Err(_) => (None, body.trim().to_string()),
    };
    let err = ServiceError {
        status: Some(status),
        code,
        network: None,
        message,
        headers,
    };

    match status {
        429 => FetchError::RateLimited(err),
        s if RETRYABLE_STATUS_CODES.contains(&s) => FetchError::TransientNetwork(err),
        _ => FetchError::QueryExecution(err),
    }
}

/// Maps a transport failure onto the pipeline taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error) -> FetchError {
    if let Some(kind) = network_failure_kind(&err) {
        return FetchError::TransientNetwork(ServiceError::network(kind, err.to_string()));
    }
    let message = err.to_string();
    match err.status() {
        Some(status) => FetchError::QueryExecution(ServiceError::http(status.as_u16(), message)),
        None => FetchError::QueryExecution(ServiceError::new(message)),
    }
}

fn network_failure_kind(err: &reqwest::Error) -> Option<NetworkFailure> {
    if err.is_timeout() {
        return Some(NetworkFailure::TimedOut);
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                    return Some(NetworkFailure::ConnectionReset);
                }
                std::io::ErrorKind::ConnectionRefused => {
                    return Some(NetworkFailure::ConnectionRefused);
                }
                std::io::ErrorKind::TimedOut => return Some(NetworkFailure::TimedOut),
                _ => {}
            }
        }
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return Some(NetworkFailure::DnsFailure);
        }
        source = cause.source();
    }

    if err.is_connect() {
        return Some(NetworkFailure::ConnectionRefused);
    }
    if err.is_request() {
        return Some(NetworkFailure::ConnectionReset);
    }
    None
}
