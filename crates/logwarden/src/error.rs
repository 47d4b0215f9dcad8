//! Error types for the log retrieval pipeline.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Row;

/// Low-level network failure kinds reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    /// The peer reset the connection.
    ConnectionReset,
    /// The connection was refused.
    ConnectionRefused,
    /// The request timed out before a response arrived.
    TimedOut,
    /// The host name could not be resolved.
    DnsFailure,
}

impl NetworkFailure {
    /// Returns a short machine-readable code for this failure.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionReset => "connection_reset",
            Self::ConnectionRefused => "connection_refused",
            Self::TimedOut => "timed_out",
            Self::DnsFailure => "dns_failure",
        }
    }
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a remote service (log query or identity).
///
/// Header names are stored lower-cased so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceError {
    /// HTTP status code, if a response was received.
    pub status: Option<u16>,
    /// Service-specific error code (e.g. `"BadArgumentError"`).
    pub code: Option<String>,
    /// Transport failure kind, if no response was received.
    pub network: Option<NetworkFailure>,
    /// Human-readable description.
    pub message: String,
    /// Response headers, keyed by lower-cased name.
    pub headers: HashMap<String, String>,
}

impl ServiceError {
    /// Creates an error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Creates an error for an HTTP response status.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Creates an error for a transport failure.
    #[must_use]
    pub fn network(kind: NetworkFailure, message: impl Into<String>) -> Self {
        Self {
            network: Some(kind),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the service error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Adds a response header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Looks up a header by name, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns true if the message mentions a timeout.
    #[must_use]
    pub fn mentions_timeout(&self) -> bool {
        let lower = self.message.to_lowercase();
        lower.contains("timeout") || lower.contains("timed out")
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "[{status}] ")?;
        }
        if let Some(kind) = self.network {
            write!(f, "[{kind}] ")?;
        }
        if let Some(ref code) = self.code {
            write!(f, "{code}: ")?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Errors that can occur while fetching logs.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Credential acquisition failed on every attempt.
    #[error("authentication failed after {attempts} attempts: {source}")]
    Authentication {
        /// Number of acquisition attempts made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: ServiceError,
    },

    /// The requested time range is empty, inverted or too wide.
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    /// A pagination cursor could not be understood.
    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    /// The log service rejected the request with HTTP 429.
    #[error("rate limited by log service: {0}")]
    RateLimited(ServiceError),

    /// A connection-level or gateway failure that may succeed on retry.
    #[error("transient network failure: {0}")]
    TransientNetwork(ServiceError),

    /// The log service reported a failure executing the query.
    #[error("query execution failed: {0}")]
    QueryExecution(ServiceError),

    /// The circuit breaker is open and the call was not attempted.
    #[error("circuit breaker open until {next_retry_time}")]
    CircuitOpen {
        /// When the breaker will admit a trial call.
        next_retry_time: DateTime<Utc>,
    },

    /// Every retry failed.
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Total invocations, including the first.
        attempts: u32,
        /// The last failure.
        #[source]
        source: Box<FetchError>,
    },

    /// `fetch_logs` was called before `initialize`.
    #[error("log fetcher not initialized; call initialize() first")]
    NotInitialized,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FetchError {
    /// Returns the service error carried by this failure, if any.
    #[must_use]
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::RateLimited(e) | Self::TransientNetwork(e) | Self::QueryExecution(e) => Some(e),
            Self::Authentication { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Returns true if this failure, or the failure it wraps, is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::RetryExhausted { source, .. } => source.is_timeout(),
            Self::RateLimited(_) | Self::Authentication { .. } => false,
            Self::TransientNetwork(e) | Self::QueryExecution(e) => {
                e.network == Some(NetworkFailure::TimedOut)
                    || matches!(e.status, Some(408 | 504))
                    || e.mentions_timeout()
            }
            _ => false,
        }
    }

    /// Returns true if the circuit breaker rejected the call.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns the root failure, unwrapping `RetryExhausted`.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// A single row that could not be turned into a log entry.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("row parse error: {reason}")]
pub struct RowParseError {
    /// Why the row was rejected.
    pub reason: String,
    /// The offending row.
    pub row: Row,
}

impl RowParseError {
    /// Creates a parse error for a row.
    #[must_use]
    pub fn new(reason: impl Into<String>, row: Row) -> Self {
        Self {
            reason: reason.into(),
            row,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = FetchError::NotInitialized;
        assert_eq!(
            err.to_string(),
            "log fetcher not initialized; call initialize() first"
        );

        let err = FetchError::InvalidTimeRange("start after end".to_string());
        assert_eq!(err.to_string(), "invalid time range: start after end");

        let err = FetchError::InvalidConfig("batch_size".to_string());
        assert_eq!(err.to_string(), "invalid configuration: batch_size");
    }

    #[test]
    fn service_error_display_includes_status_and_code() {
        let err = ServiceError::http(429, "slow down").with_code("TooManyRequests");
        assert_eq!(err.to_string(), "[429] TooManyRequests: slow down");

        let err = ServiceError::network(NetworkFailure::ConnectionReset, "reset by peer");
        assert_eq!(err.to_string(), "[connection_reset] reset by peer");
    }

    #[test]
    fn service_error_headers_are_case_insensitive() {
        let err = ServiceError::http(429, "x").with_header("Retry-After", "5");
        assert_eq!(err.header("retry-after"), Some("5"));
        assert_eq!(err.header("RETRY-AFTER"), Some("5"));
        assert_eq!(err.header("x-ms-retry-after-ms"), None);
    }

    #[test]
    fn authentication_error_carries_attempts_and_cause() {
        let err = FetchError::Authentication {
            attempts: 3,
            source: ServiceError::http(401, "invalid_client"),
        };
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.to_string().contains("invalid_client"));
        assert_eq!(err.service_error().and_then(|e| e.status), Some(401));
    }

    #[test]
    fn timeout_detection() {
        let err = FetchError::TransientNetwork(ServiceError::network(
            NetworkFailure::TimedOut,
            "request did not complete",
        ));
        assert!(err.is_timeout());

        let err = FetchError::QueryExecution(ServiceError::new("Query timed out after 30s"));
        assert!(err.is_timeout());

        let err = FetchError::TransientNetwork(ServiceError::http(504, "gateway"));
        assert!(err.is_timeout());

        let err = FetchError::TransientNetwork(ServiceError::http(503, "unavailable"));
        assert!(!err.is_timeout());

        let err = FetchError::RateLimited(ServiceError::http(429, "timeout window"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_detection_sees_through_retry_exhausted() {
        let err = FetchError::RetryExhausted {
            attempts: 4,
            source: Box::new(FetchError::QueryExecution(ServiceError::new(
                "request timeout",
            ))),
        };
        assert!(err.is_timeout());
        assert!(matches!(err.root(), FetchError::QueryExecution(_)));
    }

    #[test]
    fn circuit_open_is_distinguishable() {
        let err = FetchError::CircuitOpen {
            next_retry_time: Utc::now(),
        };
        assert!(err.is_circuit_open());
        assert!(!err.is_timeout());
        assert!(!FetchError::NotInitialized.is_circuit_open());
    }

    #[test]
    fn row_parse_error_keeps_row() {
        let mut row = Row::new();
        row.insert("message".to_string(), serde_json::json!("hi"));
        let err = RowParseError::new("missing timestamp", row.clone());
        assert_eq!(err.to_string(), "row parse error: missing timestamp");
        assert_eq!(err.row, row);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FetchError>();
        assert_send_sync::<RowParseError>();
    }

    #[test]
    fn result_type_err() {
        let result: Result<i32> = Err(FetchError::NotInitialized);
        assert!(result.is_err());
    }
}
