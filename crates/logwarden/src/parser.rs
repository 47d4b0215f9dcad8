//! Conversion of raw result rows into [`LogEntry`] values.
//!
//! Every row is parsed on its own. A bad row is counted and recorded in
//! [`ParseOutcome::errors`]; the rest of the batch is still returned.
//!
//! Fields are looked up in this order: the dedicated column, then a field of
//! the same name inside the nested metadata bag, then a default.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::RowParseError;
use crate::query::METADATA_COLUMN;
use crate::types::{LogEntry, Row, Severity, UNKNOWN_SEVERITY};

const TIMESTAMP_COLUMN: &str = "timestamp";
const SEVERITY_COLUMN: &str = "severityLevel";
const MESSAGE_COLUMN: &str = "message";
const ITEM_TYPE_COLUMN: &str = "itemType";
const OPERATION_COLUMN: &str = "operation_Name";
const ERROR_CODE_COLUMN: &str = "errorCode";
const STACK_TRACE_COLUMN: &str = "stackTrace";
const SOURCE_LOCATION_COLUMN: &str = "sourceLocation";

const CONSUMED_COLUMNS: [&str; 9] = [
    TIMESTAMP_COLUMN,
    SEVERITY_COLUMN,
    MESSAGE_COLUMN,
    ITEM_TYPE_COLUMN,
    OPERATION_COLUMN,
    METADATA_COLUMN,
    ERROR_CODE_COLUMN,
    STACK_TRACE_COLUMN,
    SOURCE_LOCATION_COLUMN,
];

/// Naive timestamp layouts accepted in addition to RFC 3339; read as UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// The result of parsing a batch of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    /// Successfully parsed entries, in input order
    pub entries: Vec<LogEntry>,
    /// Rows that failed to parse
    pub failed_count: usize,
    /// Rows seen
    pub total_count: usize,
    /// One error per failed row
    pub errors: Vec<RowParseError>,
}

/// Parser for log query rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser;

impl ResponseParser {
    /// Creates a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parses a batch of rows, collecting per-row failures.
    #[must_use]
    pub fn parse_rows(&self, rows: &[Row]) -> ParseOutcome {
        let mut outcome = ParseOutcome {
            total_count: rows.len(),
            ..ParseOutcome::default()
        };

        for row in rows {
            match self.parse_row(row) {
                Ok(entry) => outcome.entries.push(entry),
                Err(err) => {
                    debug!(reason = %err.reason, "skipping unparseable row");
                    outcome.failed_count += 1;
                    outcome.errors.push(err);
                }
            }
        }

        outcome
    }

    /// Parses one row.
    pub fn parse_row(&self, row: &Row) -> Result<LogEntry, RowParseError> {
        let nested = parse_nested_metadata(row.get(METADATA_COLUMN));
        let nested_obj = nested.as_object();
        let lookup = |name: &str| field(row, nested_obj, name);

        let timestamp = match lookup(TIMESTAMP_COLUMN) {
            Some(value) => parse_timestamp(value).ok_or_else(|| {
                RowParseError::new(format!("unparseable timestamp: {value}"), row.clone())
            })?,
            None => return Err(RowParseError::new("missing timestamp", row.clone())),
        };

        let message = lookup(MESSAGE_COLUMN)
            .and_then(coerce_message)
            .ok_or_else(|| RowParseError::new("missing message", row.clone()))?;

        let severity = parse_severity(lookup(SEVERITY_COLUMN));

        let error_code = optional_string(lookup(ERROR_CODE_COLUMN))
            .or_else(|| optional_string(nested_obj.and_then(|m| m.get("ErrorCode"))));
        let stack_trace = optional_string(lookup(STACK_TRACE_COLUMN))
            .or_else(|| optional_string(nested_obj.and_then(|m| m.get("StackTrace"))));
        let source_location = optional_string(lookup(SOURCE_LOCATION_COLUMN))
            .or_else(|| optional_string(nested_obj.and_then(|m| m.get("SourceLocation"))));

        let mut metadata = serde_json::Map::new();
        metadata.insert(METADATA_COLUMN.to_string(), nested.clone());
        if let Some(item_type) = row.get(ITEM_TYPE_COLUMN) {
            metadata.insert("itemType".to_string(), item_type.clone());
        }
        if let Some(operation) = row.get(OPERATION_COLUMN) {
            metadata.insert("operationName".to_string(), operation.clone());
        }
        for (key, value) in row {
            if !CONSUMED_COLUMNS.contains(&key.as_str()) {
                metadata.insert(key.clone(), value.clone());
            }
        }

        Ok(LogEntry {
            timestamp,
            severity,
            message,
            error_code,
            stack_trace,
            source_location,
            metadata,
            raw: row.clone(),
        })
    }
}

/// Returns true for entries of severity `Error` or `Critical`.
#[must_use]
pub fn is_error_or_critical(entry: &LogEntry) -> bool {
    entry.is_error_or_critical()
}

/// Returns true for entries of severity `Warning` or above.
#[must_use]
pub fn is_warning_or_higher(entry: &LogEntry) -> bool {
    entry.is_warning_or_higher()
}

/// Column first, then the nested bag; nulls count as absent.
fn field<'a>(
    row: &'a Row,
    nested: Option<&'a serde_json::Map<String, Value>>,
    name: &str,
) -> Option<&'a Value> {
    row.get(name)
        .filter(|v| !v.is_null())
        .or_else(|| nested.and_then(|m| m.get(name)).filter(|v| !v.is_null()))
}

/// Decodes the metadata column; malformed JSON becomes `null`.
fn parse_nested_metadata(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Accepts RFC 3339 strings, naive ISO strings (UTC) and epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

fn parse_severity(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => {
            let ordinal = n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64));
            match ordinal {
                Some(o) => Severity::from_ordinal(o)
                    .map_or_else(|| format!("Level{o}"), |s| s.as_str().to_string()),
                None => UNKNOWN_SEVERITY.to_string(),
            }
        }
        Some(Value::String(s)) => s.clone(),
        _ => UNKNOWN_SEVERITY.to_string(),
    }
}

fn coerce_message(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn valid_row(message: &str) -> Row {
        row(json!({
            "timestamp": "2024-01-01T10:00:00Z",
            "severityLevel": 3,
            "message": message,
        }))
    }

    #[test]
    fn parses_complete_row() {
        let r = row(json!({
            "timestamp": "2024-01-01T10:00:00.123Z",
            "severityLevel": 4,
            "message": "  disk full  ",
            "itemType": "trace",
            "operation_Name": "POST /upload",
            "customDimensions": "{\"ErrorCode\":\"E42\",\"region\":\"eu\"}",
            "errorCode": "E42",
            "stackTrace": "at main()",
            "sourceLocation": "upload.rs:10",
        }));
        let entry = ResponseParser::new().parse_row(&r).unwrap();

        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(123)
        );
        assert_eq!(entry.severity, "Critical");
        assert_eq!(entry.message, "disk full");
        assert_eq!(entry.error_code.as_deref(), Some("E42"));
        assert_eq!(entry.stack_trace.as_deref(), Some("at main()"));
        assert_eq!(entry.source_location.as_deref(), Some("upload.rs:10"));
        assert_eq!(entry.metadata["itemType"], json!("trace"));
        assert_eq!(entry.metadata["operationName"], json!("POST /upload"));
        assert_eq!(entry.metadata["customDimensions"]["region"], json!("eu"));
        assert_eq!(entry.raw, r);
    }

    #[test]
    fn nested_json_string_is_parsed_into_object() {
        let mut r = valid_row("m");
        r.insert(
            "customDimensions".to_string(),
            json!("{\"user\":\"alice\",\"attempt\":2,\"tags\":[\"a\",\"b\"]}"),
        );
        let entry = ResponseParser::new().parse_row(&r).unwrap();
        assert_eq!(
            entry.metadata["customDimensions"],
            json!({"user": "alice", "attempt": 2, "tags": ["a", "b"]})
        );
    }

    #[test]
    fn malformed_nested_json_becomes_null() {
        let mut r = valid_row("m");
        r.insert("customDimensions".to_string(), json!("{not json"));
        let entry = ResponseParser::new().parse_row(&r).unwrap();
        assert_eq!(entry.metadata["customDimensions"], Value::Null);
    }

    #[test]
    fn optional_fields_fall_back_to_nested_metadata() {
        let r = row(json!({
            "timestamp": "2024-01-01T10:00:00Z",
            "message": "m",
            "errorCode": "",
            "customDimensions": {
                "ErrorCode": "E1",
                "stackTrace": "trace from bag",
                "SourceLocation": "lib.rs:1",
            },
        }));
        let entry = ResponseParser::new().parse_row(&r).unwrap();
        assert_eq!(entry.error_code.as_deref(), Some("E1"));
        assert_eq!(entry.stack_trace.as_deref(), Some("trace from bag"));
        assert_eq!(entry.source_location.as_deref(), Some("lib.rs:1"));
    }

    #[test]
    fn required_fields_fall_back_to_nested_metadata() {
        let r = row(json!({
            "customDimensions": {
                "timestamp": "2024-01-01T10:00:00Z",
                "message": "from bag",
                "severityLevel": 1,
            },
        }));
        let entry = ResponseParser::new().parse_row(&r).unwrap();
        assert_eq!(entry.message, "from bag");
        assert_eq!(entry.severity, "Information");
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let entry = ResponseParser::new().parse_row(&valid_row("m")).unwrap();
        assert!(entry.error_code.is_none());
        assert!(entry.stack_trace.is_none());
        assert!(entry.source_location.is_none());
        assert_eq!(entry.metadata["customDimensions"], Value::Null);
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        for value in [
            json!("2024-01-01T10:00:00Z"),
            json!("2024-01-01T12:00:00+02:00"),
            json!("2024-01-01T10:00:00.000"),
            json!("2024-01-01 10:00:00"),
            json!(expected.timestamp_millis()),
        ] {
            assert_eq!(parse_timestamp(&value), Some(expected), "value {value}");
        }
    }

    #[test]
    fn timestamp_rejects_garbage() {
        for value in [json!("yesterday"), json!(true), json!({"t": 1}), json!([])] {
            assert_eq!(parse_timestamp(&value), None, "value {value}");
        }
    }

    #[test]
    fn severity_rendering() {
        assert_eq!(parse_severity(Some(&json!(0))), "Verbose");
        assert_eq!(parse_severity(Some(&json!(2))), "Warning");
        assert_eq!(parse_severity(Some(&json!(3.0))), "Error");
        assert_eq!(parse_severity(Some(&json!(9))), "Level9");
        assert_eq!(parse_severity(Some(&json!("Fatal"))), "Fatal");
        assert_eq!(parse_severity(Some(&json!(true))), "Unknown");
        assert_eq!(parse_severity(None), "Unknown");
    }

    #[test]
    fn message_coercion() {
        let mut r = valid_row("x");
        r.insert("message".to_string(), json!(404));
        assert_eq!(ResponseParser::new().parse_row(&r).unwrap().message, "404");

        r.insert("message".to_string(), json!({"a": 1}));
        assert_eq!(
            ResponseParser::new().parse_row(&r).unwrap().message,
            "{\"a\":1}"
        );
    }

    #[test]
    fn missing_or_null_message_fails() {
        let mut r = valid_row("x");
        r.insert("message".to_string(), Value::Null);
        let err = ResponseParser::new().parse_row(&r).unwrap_err();
        assert_eq!(err.reason, "missing message");

        r.remove("message");
        assert!(ResponseParser::new().parse_row(&r).is_err());
    }

    #[test]
    fn extra_columns_land_in_metadata() {
        let mut r = valid_row("m");
        r.insert("cloud_RoleName".to_string(), json!("api"));
        let entry = ResponseParser::new().parse_row(&r).unwrap();
        assert_eq!(entry.metadata["cloud_RoleName"], json!("api"));
        assert!(!entry.metadata.contains_key("message"));
    }

    #[test]
    fn bad_rows_do_not_abort_batch() {
        let mut bad_ts = valid_row("bad");
        bad_ts.insert("timestamp".to_string(), json!("not a time"));
        let mut no_ts = valid_row("none");
        no_ts.remove("timestamp");

        let rows = vec![valid_row("a"), bad_ts.clone(), valid_row("b"), no_ts];
        let outcome = ResponseParser::new().parse_rows(&rows);

        assert_eq!(outcome.total_count, 4);
        assert_eq!(outcome.failed_count, 2);
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].message, "a");
        assert_eq!(outcome.entries[1].message, "b");
        assert_eq!(outcome.errors[0].row, bad_ts);
        assert_eq!(outcome.errors[1].reason, "missing timestamp");
    }

    #[test]
    fn classification_helpers() {
        let parser = ResponseParser::new();
        let mut r = valid_row("m");
        r.insert("severityLevel".to_string(), json!(2));
        let warning = parser.parse_row(&r).unwrap();
        assert!(is_warning_or_higher(&warning));
        assert!(!is_error_or_critical(&warning));

        r.insert("severityLevel".to_string(), json!(4));
        let critical = parser.parse_row(&r).unwrap();
        assert!(is_error_or_critical(&critical));
    }

    proptest! {
        #[test]
        fn prop_failed_rows_are_counted(flags in prop::collection::vec(any::<bool>(), 0..50)) {
            let rows: Vec<Row> = flags
                .iter()
                .enumerate()
                .map(|(i, ok)| {
                    let mut r = valid_row(&format!("row {i}"));
                    if !ok {
                        r.insert("timestamp".to_string(), json!("invalid"));
                    }
                    r
                })
                .collect();
            let invalid = flags.iter().filter(|ok| !**ok).count();

            let outcome = ResponseParser::new().parse_rows(&rows);
            prop_assert_eq!(outcome.total_count, rows.len());
            prop_assert_eq!(outcome.failed_count, invalid);
            prop_assert_eq!(outcome.entries.len(), rows.len() - invalid);
            prop_assert_eq!(outcome.errors.len(), invalid);
        }
    }
}
