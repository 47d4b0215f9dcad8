//! # logwarden
//!
//! Resilient retrieval of structured logs from a Log Analytics workspace.
//!
//! This crate provides:
//!
//! - [`LogFetcher`] — Composes the pieces below into `fetch_logs`
//! - [`CredentialProvider`] — Cached credential with backoff on acquisition
//! - [`QueryBuilder`] — Time-bounded, severity-filtered KQL queries
//! - [`ResponseParser`] — Tolerant row-to-[`LogEntry`] conversion
//! - [`RetryExecutor`] — Rate-limit-aware retry with jittered backoff
//! - [`CircuitBreaker`] — Short-circuits calls while the service is down
//! - [`LogQueryClient`] / [`TokenSource`] — Seams to the outside world, with
//!   HTTP implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use logwarden::{CredentialConfig, FetcherConfig, LogFetcher};
//!
//! # async fn run() -> logwarden::Result<()> {
//! let config = FetcherConfig::new("00000000-0000-0000-0000-000000000000");
//! let credentials = CredentialConfig {
//!     tenant_id: "tenant".to_string(),
//!     client_id: "client".to_string(),
//!     client_secret: "secret".to_string(),
//!     ..CredentialConfig::default()
//! };
//!
//! let fetcher = LogFetcher::connect(config, &credentials)?;
//! fetcher.initialize().await?;
//!
//! let result = fetcher.fetch_logs(None).await?;
//! for entry in result.entries.iter().filter(|e| e.is_error_or_critical()) {
//!     println!("{} [{}] {}", entry.timestamp, entry.severity, entry.message);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod fetcher;
pub mod parser;
pub mod query;
pub mod retry;
pub mod types;

// Re-export main types
pub use circuit::{CircuitBreaker, CircuitState, CircuitStats};
pub use client::{
    Column, HttpLogQueryClient, LogQueryClient, QueryRequest, QueryResponse, QueryStatus, Table,
};
pub use config::{
    CircuitBreakerConfig, CredentialConfig, FetcherConfig, NarrowingConfig, RetryConfig,
};
pub use credential::{
    AccessToken, ClientSecretTokenSource, Credential, CredentialProvider, TokenSource,
};
pub use error::{FetchError, NetworkFailure, Result, RowParseError, ServiceError};
pub use fetcher::LogFetcher;
pub use parser::{is_error_or_critical, is_warning_or_higher, ParseOutcome, ResponseParser};
pub use query::QueryBuilder;
pub use retry::{FailureClass, RateLimitAlert, RetryExecutor};
pub use types::{LogEntry, QueryResult, Row, Severity, TimeRange};
