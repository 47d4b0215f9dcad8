//! Core types for the log retrieval pipeline.
//!
//! This module provides:
//! - [`Severity`] — The fixed 0–4 severity scale used by the log service
//! - [`LogEntry`] — A parsed, typed log record
//! - [`TimeRange`] — A validated query window
//! - [`QueryResult`] — Entries plus execution metadata for one fetch

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

/// A raw result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Severity rendered when a row carries no recognizable severity.
pub const UNKNOWN_SEVERITY: &str = "Unknown";

/// Widest window a single query may span.
pub const MAX_TIME_RANGE_DAYS: i64 = 30;

/// Log severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Detailed diagnostic output
    Verbose = 0,
    /// Normal operation
    Information = 1,
    /// Something unexpected but recoverable
    Warning = 2,
    /// A failed operation
    Error = 3,
    /// A failure requiring immediate attention
    Critical = 4,
}

impl Severity {
    /// All severities in ordinal order.
    pub const ALL: [Self; 5] = [
        Self::Verbose,
        Self::Information,
        Self::Warning,
        Self::Error,
        Self::Critical,
    ];

    /// Returns the numeric ordinal used by the log service.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Maps a numeric ordinal to a severity.
    #[must_use]
    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| i64::from(s.ordinal()) == ordinal)
    }

    /// Maps a severity name to a severity, ignoring case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name))
    }

    /// Returns the canonical name of this severity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the record was emitted
    pub timestamp: DateTime<Utc>,
    /// Severity name, or `"Unknown"` / `"Level{N}"`
    pub severity: String,
    /// The log message
    pub message: String,
    /// Application error code, if any
    pub error_code: Option<String>,
    /// Stack trace, if any
    pub stack_trace: Option<String>,
    /// Source file/line, if any
    pub source_location: Option<String>,
    /// Nested metadata plus item type, operation and unrecognized columns
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// The original row
    #[serde(default)]
    pub raw: Row,
}

impl LogEntry {
    /// Returns the severity ordinal, if the severity name is recognized.
    #[must_use]
    pub fn severity_ordinal(&self) -> Option<u8> {
        Severity::from_name(&self.severity).map(Severity::ordinal)
    }

    /// Returns true for `Error` and `Critical` entries.
    #[must_use]
    pub fn is_error_or_critical(&self) -> bool {
        self.severity_ordinal()
            .is_some_and(|o| o >= Severity::Error.ordinal())
    }

    /// Returns true for `Warning` and above.
    #[must_use]
    pub fn is_warning_or_higher(&self) -> bool {
        self.severity_ordinal()
            .is_some_and(|o| o >= Severity::Warning.ordinal())
    }
}

/// A query window. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the window
    pub start: DateTime<Utc>,
    /// End of the window
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a time range. Call [`TimeRange::validate`] before querying.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Creates the window `[now - minutes, now]`.
    #[must_use]
    pub fn last_minutes(now: DateTime<Utc>, minutes: u32) -> Self {
        Self {
            start: now - Duration::minutes(i64::from(minutes)),
            end: now,
        }
    }

    /// Returns the span of the window.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Checks that `start < end` and the span is at most 30 days.
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(FetchError::InvalidTimeRange(format!(
                "start {} must be before end {}",
                format_instant(self.start),
                format_instant(self.end)
            )));
        }
        if self.duration() > Duration::days(MAX_TIME_RANGE_DAYS) {
            return Err(FetchError::InvalidTimeRange(format!(
                "span of {} hours exceeds the {MAX_TIME_RANGE_DAYS} day maximum",
                self.duration().num_hours()
            )));
        }
        Ok(())
    }

    /// Returns `[start, start + span / factor]`.
    ///
    /// Factors below 2 would not narrow the window and are rejected.
    pub fn narrowed(&self, factor: u32) -> Result<Self> {
        if factor < 2 {
            return Err(FetchError::InvalidTimeRange(format!(
                "reduction factor must be at least 2, got {factor}"
            )));
        }
        let span = self.duration() / factor as i32;
        Ok(Self {
            start: self.start,
            end: self.start + span,
        })
    }

    /// Formats the window as an ISO-8601 interval (`start/end`).
    #[must_use]
    pub fn to_iso_interval(&self) -> String {
        format!("{}/{}", format_instant(self.start), format_instant(self.end))
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            format_instant(self.start),
            format_instant(self.end)
        )
    }
}

/// Formats an instant as RFC 3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats a pagination cursor at the service's 100 ns timestamp resolution.
///
/// Always seven fractional digits, so a cursor never rounds below a row the
/// previous page did not return.
#[must_use]
pub fn format_cursor(instant: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        instant.format("%Y-%m-%dT%H:%M:%S"),
        instant.timestamp_subsec_nanos() / 100
    )
}

/// Entries returned by one fetch, with execution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Parsed entries, newest first
    pub entries: Vec<LogEntry>,
    /// Rows returned by the service, parsed or not
    pub total_count: usize,
    /// Rows that could not be parsed
    pub failed_count: usize,
    /// True when the batch was full; more rows may exist (approximate)
    pub has_more: bool,
    /// Cursor for the next page when `has_more` is set
    pub continuation_token: Option<String>,
    /// Wall-clock time spent executing the query
    pub duration_ms: u64,
    /// Service request identifier, when reported
    pub request_id: Option<String>,
    /// The window actually queried (narrower than requested after a timeout)
    pub time_range: TimeRange,
    /// Partial-failure message reported alongside the rows
    pub partial_error: Option<String>,
}
