//! KQL query construction.
//!
//! [`QueryBuilder`] renders a fixed-schema query over the configured source
//! tables. Output is normalized (lines trimmed, blank lines dropped) so the
//! same inputs always produce byte-identical text.

use chrono::{DateTime, Utc};

use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::types::{format_cursor, format_instant, Severity, TimeRange};

/// Column holding the nested metadata bag.
pub const METADATA_COLUMN: &str = "customDimensions";

/// Columns projected by every log query, in order.
pub const PROJECTED_COLUMNS: [&str; 9] = [
    "timestamp",
    "severityLevel",
    "message",
    "itemType",
    "operation_Name",
    METADATA_COLUMN,
    "errorCode",
    "stackTrace",
    "sourceLocation",
];

/// Builds log and count queries for one workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    source_tables: Vec<String>,
    min_severity: u8,
    batch_size: u32,
}

impl QueryBuilder {
    /// Creates a builder.
    ///
    /// The severity threshold is the lowest ordinal among `severity_levels`;
    /// unrecognized names are ignored and an empty set means no filtering.
    #[must_use]
    pub fn new(source_tables: Vec<String>, severity_levels: &[String], batch_size: u32) -> Self {
        Self {
            source_tables,
            min_severity: min_severity_ordinal(severity_levels),
            batch_size,
        }
    }

    /// Creates a builder from fetcher configuration.
    #[must_use]
    pub fn from_config(config: &FetcherConfig) -> Self {
        Self::new(
            config.source_tables.clone(),
            &config.severity_levels,
            config.batch_size,
        )
    }

    /// Returns the severity ordinal used in the `severityLevel >=` filter.
    #[must_use]
    pub const fn min_severity(&self) -> u8 {
        self.min_severity
    }

    /// Returns the row limit.
    #[must_use]
    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Builds the log query for `range`, optionally resuming below a cursor.
    pub fn build_query(&self, range: &TimeRange, continuation_token: Option<&str>) -> Result<String> {
        range.validate()?;
        let cursor = continuation_token.map(parse_continuation_token).transpose()?;

        let mut lines = self.filter_lines(range);
        if let Some(cursor) = cursor {
            lines.push(format!(
                "| where timestamp < datetime({})",
                format_cursor(cursor)
            ));
        }
        lines.push(format!(
            "| extend errorCode = tostring({METADATA_COLUMN}.ErrorCode), \
             stackTrace = tostring({METADATA_COLUMN}.StackTrace), \
             sourceLocation = tostring({METADATA_COLUMN}.SourceLocation)"
        ));
        lines.push(format!("| project {}", PROJECTED_COLUMNS.join(", ")));
        lines.push("| order by timestamp desc".to_string());
        lines.push(format!("| take {}", self.batch_size));

        Ok(normalize(&lines))
    }

    /// Builds the log query for the first `1/factor` of `range`.
    pub fn build_reduced_time_range_query(&self, range: &TimeRange, factor: u32) -> Result<String> {
        range.validate()?;
        let reduced = range.narrowed(factor)?;
        self.build_query(&reduced, None)
    }

    /// Builds a query returning only the number of matching rows.
    pub fn build_count_query(&self, range: &TimeRange) -> Result<String> {
        range.validate()?;
        let mut lines = self.filter_lines(range);
        lines.push("| count".to_string());
        Ok(normalize(&lines))
    }

    fn filter_lines(&self, range: &TimeRange) -> Vec<String> {
        vec![
            format!("union {}", self.source_tables.join(", ")),
            format!(
                "| where timestamp between (datetime({}) .. datetime({}))",
                format_instant(range.start),
                format_instant(range.end)
            ),
            format!("| where severityLevel >= {}", self.min_severity),
        ]
    }
}

/// Maps severity names to the lowest recognized ordinal.
#[must_use]
pub fn min_severity_ordinal(severity_levels: &[String]) -> u8 {
    severity_levels
        .iter()
        .filter_map(|name| Severity::from_name(name))
        .map(Severity::ordinal)
        .min()
        .unwrap_or(Severity::Verbose.ordinal())
}

/// Parses a continuation token into the instant it encodes.
pub fn parse_continuation_token(token: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(token.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::InvalidContinuationToken(format!("{token:?}: {e}")))
}

/// Trims every line and drops blank ones.
#[must_use]
pub fn normalize(lines: &[String]) -> String {
    lines
        .iter()
        .flat_map(|l| l.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn builder(batch_size: u32) -> QueryBuilder {
        QueryBuilder::new(
            vec!["traces".to_string(), "exceptions".to_string()],
            &["Error".to_string(), "Warning".to_string()],
            batch_size,
        )
    }

    fn day_range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap(),
        )
    }

    #[test]
    fn build_query_full_day_example() {
        let query = builder(100).build_query(&day_range(), None).unwrap();

        assert!(query.contains("take 100"));
        assert!(query.contains("order by timestamp desc"));
        assert!(query.contains("2024-01-01T00:00:00.000Z"));
        assert!(query.contains("2024-01-01T23:59:59.000Z"));
    }

    #[test]
    fn build_query_exact_text() {
        let query = builder(100).build_query(&day_range(), None).unwrap();
        let expected = "union traces, exceptions\n\
            | where timestamp between (datetime(2024-01-01T00:00:00.000Z) .. datetime(2024-01-01T23:59:59.000Z))\n\
            | where severityLevel >= 2\n\
            | extend errorCode = tostring(customDimensions.ErrorCode), stackTrace = tostring(customDimensions.StackTrace), sourceLocation = tostring(customDimensions.SourceLocation)\n\
            | project timestamp, severityLevel, message, itemType, operation_Name, customDimensions, errorCode, stackTrace, sourceLocation\n\
            | order by timestamp desc\n\
            | take 100";
        assert_eq!(query, expected);
    }

    #[test]
    fn build_query_is_deterministic() {
        let b = builder(10);
        assert_eq!(
            b.build_query(&day_range(), None).unwrap(),
            b.build_query(&day_range(), None).unwrap()
        );
    }

    #[test]
    fn severity_threshold_uses_least_severe_level() {
        let b = QueryBuilder::new(
            vec!["traces".to_string()],
            &["Critical".to_string(), "Information".to_string(), "Error".to_string()],
            10,
        );
        assert_eq!(b.min_severity(), 1);
    }

    #[test]
    fn severity_threshold_ignores_unknown_names() {
        assert_eq!(
            min_severity_ordinal(&["Fatal".to_string(), "critical".to_string()]),
            4
        );
        assert_eq!(min_severity_ordinal(&["Fatal".to_string()]), 0);
        assert_eq!(min_severity_ordinal(&[]), 0);
    }

    #[test]
    fn build_query_rejects_inverted_range() {
        let r = day_range();
        let inverted = TimeRange::new(r.end, r.start);
        assert!(matches!(
            builder(10).build_query(&inverted, None),
            Err(FetchError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn build_query_rejects_range_over_thirty_days() {
        let start = day_range().start;
        let wide = TimeRange::new(start, start + Duration::days(31));
        assert!(matches!(
            builder(10).build_query(&wide, None),
            Err(FetchError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn continuation_token_adds_cursor_filter() {
        let query = builder(10)
            .build_query(&day_range(), Some("2024-01-01T12:00:00+00:00"))
            .unwrap();
        assert!(query.contains("| where timestamp < datetime(2024-01-01T12:00:00.0000000Z)"));
        let cursor_pos = query.find("timestamp < datetime").unwrap();
        let order_pos = query.find("order by").unwrap();
        assert!(cursor_pos < order_pos);
    }

    #[test]
    fn cursor_filter_keeps_sub_millisecond_precision() {
        let query = builder(10)
            .build_query(&day_range(), Some("2024-01-01T12:00:00.1234567Z"))
            .unwrap();
        assert!(query.contains("| where timestamp < datetime(2024-01-01T12:00:00.1234567Z)"));
    }

    #[test]
    fn continuation_token_must_be_an_instant() {
        let result = builder(10).build_query(&day_range(), Some("') | drop table x"));
        assert!(matches!(
            result,
            Err(FetchError::InvalidContinuationToken(_))
        ));
    }

    #[test]
    fn reduced_query_uses_first_half_of_window() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap(),
        );
        let query = builder(10).build_reduced_time_range_query(&range, 2).unwrap();
        assert!(query.contains(
            "between (datetime(2024-01-01T00:00:00.000Z) .. datetime(2024-01-01T02:00:00.000Z))"
        ));
    }

    #[test]
    fn reduced_query_rejects_invalid_input() {
        let r = day_range();
        assert!(builder(10).build_reduced_time_range_query(&r, 1).is_err());
        assert!(builder(10)
            .build_reduced_time_range_query(&TimeRange::new(r.end, r.start), 2)
            .is_err());
    }

    #[test]
    fn count_query_shares_filters_and_counts() {
        let query = builder(10).build_count_query(&day_range()).unwrap();
        assert!(query.starts_with("union traces, exceptions"));
        assert!(query.contains("severityLevel >= 2"));
        assert!(query.ends_with("| count"));
        assert!(!query.contains("take"));
        assert!(!query.contains("project"));
    }

    #[test]
    fn normalize_trims_and_drops_blank_lines() {
        let lines = vec![
            "  union a  ".to_string(),
            String::new(),
            "   ".to_string(),
            "| take 1\n\n| count".to_string(),
        ];
        assert_eq!(normalize(&lines), "union a\n| take 1\n| count");
    }

    proptest! {
        #[test]
        fn prop_valid_ranges_render_bounds_and_limit(
            start_secs in 1_600_000_000i64..1_800_000_000i64,
            span_secs in 1i64..=(30 * 24 * 3600),
            batch in 1u32..=10_000,
        ) {
            let start = Utc.timestamp_opt(start_secs, 0).unwrap();
            let range = TimeRange::new(start, start + Duration::seconds(span_secs));
            let query = builder(batch).build_query(&range, None).unwrap();
            prop_assert!(query.contains(&format_instant(range.start)));
            prop_assert!(query.contains(&format_instant(range.end)));
            let take = format!("take {batch}");
            prop_assert!(query.contains(&take));
        }

        #[test]
        fn prop_invalid_ranges_always_fail(
            start_secs in 1_600_000_000i64..1_800_000_000i64,
            back_secs in 0i64..1_000_000,
            over_secs in 1i64..1_000_000,
        ) {
            let start = Utc.timestamp_opt(start_secs, 0).unwrap();
            let inverted = TimeRange::new(start, start - Duration::seconds(back_secs));
            let is_invalid_time_range = matches!(
                builder(10).build_query(&inverted, None),
                Err(FetchError::InvalidTimeRange(_))
            );
            prop_assert!(is_invalid_time_range);

            let wide = TimeRange::new(start, start + Duration::days(30) + Duration::seconds(over_secs));
            let is_invalid_time_range = matches!(
                builder(10).build_query(&wide, None),
                Err(FetchError::InvalidTimeRange(_))
            );
            prop_assert!(is_invalid_time_range);
        }
    }
}
