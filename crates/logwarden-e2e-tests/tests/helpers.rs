//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use logwarden::{
    CircuitBreakerConfig, CredentialConfig, FetcherConfig, RetryConfig, TimeRange,
};
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Workspace used by every test.
pub const WORKSPACE_ID: &str = "ws-e2e";

/// Tenant used by every test.
pub const TENANT_ID: &str = "tenant-e2e";

/// Path of the log query endpoint for [`WORKSPACE_ID`].
pub const QUERY_PATH: &str = "/v1/workspaces/ws-e2e/query";

/// Path of the token endpoint for [`TENANT_ID`].
pub const TOKEN_PATH: &str = "/tenant-e2e/oauth2/v2.0/token";

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Start a fake serving both the identity and the log query APIs.
pub async fn start_server() -> ServerGuard {
    init_tracing();
    mockito::Server::new_async().await
}

/// Credentials pointing both endpoints at `server`.
pub fn credential_config(server: &ServerGuard) -> CredentialConfig {
    CredentialConfig {
        tenant_id: TENANT_ID.to_string(),
        client_id: "e2e-client".to_string(),
        client_secret: "e2e-secret".to_string(),
        authority_host: server.url(),
        query_endpoint: server.url(),
        max_attempts: 1,
    }
}

/// Fetcher settings with short delays.
pub fn fetcher_config() -> FetcherConfig {
    FetcherConfig {
        retry: RetryConfig {
            max_retries: 2,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            ..RetryConfig::default()
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        },
        ..FetcherConfig::new(WORKSPACE_ID)
    }
}

/// A fixed instant on 2024-05-01.
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

/// The hour starting at `hour`.
pub fn hour_window(hour: u32) -> TimeRange {
    TimeRange::new(at(hour, 0), at(hour + 1, 0))
}

/// Mock a successful token response, expected `hits` times.
pub async fn mock_token(server: &mut ServerGuard, hits: usize) -> Mock {
    server
        .mock("POST", TOKEN_PATH)
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "client_credentials".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token_type":"Bearer","expires_in":3600,"access_token":"e2e-token"}"#)
        .expect(hits)
        .create_async()
        .await
}

/// One log row as the query service returns it.
pub fn log_row(timestamp: DateTime<Utc>, severity: i64, message: &str, dimensions: &Value) -> Value {
    json!([
        timestamp.to_rfc3339(),
        severity,
        message,
        "trace",
        "POST /orders",
        dimensions.to_string(),
        "",
        "",
        "",
    ])
}

/// A query response body holding `rows` in the projected schema.
pub fn table_body(rows: &[Value]) -> String {
    json!({
        "tables": [{
            "name": "PrimaryResult",
            "columns": [
                {"name": "timestamp", "type": "datetime"},
                {"name": "severityLevel", "type": "int"},
                {"name": "message", "type": "string"},
                {"name": "itemType", "type": "string"},
                {"name": "operation_Name", "type": "string"},
                {"name": "customDimensions", "type": "dynamic"},
                {"name": "errorCode", "type": "string"},
                {"name": "stackTrace", "type": "string"},
                {"name": "sourceLocation", "type": "string"},
            ],
            "rows": rows,
        }]
    })
    .to_string()
}

/// A `| count` response body.
pub fn count_body(count: u64) -> String {
    json!({
        "tables": [{
            "name": "PrimaryResult",
            "columns": [{"name": "Count", "type": "long"}],
            "rows": [[count]],
        }]
    })
    .to_string()
}

/// Matches a query request whose `timespan` is exactly `range`.
pub fn timespan_matcher(range: &TimeRange) -> Matcher {
    Matcher::PartialJson(json!({ "timespan": range.to_iso_interval() }))
}
