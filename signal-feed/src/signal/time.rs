//! Timestamp normalisation.
//!
//! Servers send event times either as epoch milliseconds or as ISO-8601 strings. Everything is
//! converted to `i64` epoch milliseconds here so ordering never compares mixed representations.

use crate::error::NormalizeError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Current wall clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a raw JSON timestamp into epoch milliseconds.
///
/// Returns `Ok(None)` for `null`, numeric strings are accepted as epoch milliseconds.
pub fn epoch_millis(value: &Value) -> Result<Option<i64>, NormalizeError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.round() as i64))
            .map(Some)
            .ok_or_else(|| NormalizeError::InvalidTimestamp(number.to_string())),
        Value::String(text) => parse_text(text).map(Some),
        other => Err(NormalizeError::InvalidTimestamp(other.to_string())),
    }
}

fn parse_text(text: &str) -> Result<i64, NormalizeError> {
    let text = text.trim();

    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }

    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Ok(datetime.timestamp_millis());
    }

    // ISO-8601 without an offset is treated as UTC
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc().timestamp_millis())
        .map_err(|_| NormalizeError::InvalidTimestamp(text.to_string()))
}
