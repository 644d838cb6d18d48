//! Timestamp parsing shared by the market-data parsers and the action table.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// Accepts unix seconds/millis (int or float), ISO-8601 with or without
/// fractional seconds, or a plain digit string. Returns seconds since epoch.
pub fn parse_unix_ts(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    match value {
        Value::Null => None,
        Value::Number(n) => {
            let ts = n.as_f64()? as i64;
            Some(normalize_millis(ts))
        }
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return None;
            }
            if let Ok(ts) = text.parse::<i64>() {
                return Some(normalize_millis(ts));
            }
            parse_iso(text)
        }
        _ => None,
    }
}

fn normalize_millis(ts: i64) -> i64 {
    if ts > MILLIS_THRESHOLD {
        ts / 1000
    } else {
        ts
    }
}

fn parse_iso(text: &str) -> Option<i64> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp())
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn format_iso_z(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

pub fn utc_day_start_ts() -> i64 {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_seconds_and_millis() {
        assert_eq!(parse_unix_ts(Some(&json!(1_700_000_000))), Some(1_700_000_000));
        assert_eq!(
            parse_unix_ts(Some(&json!(1_700_000_000_000i64))),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn parses_iso_variants() {
        assert_eq!(
            parse_unix_ts(Some(&json!("2023-11-14T22:13:20Z"))),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_unix_ts(Some(&json!("2023-11-14T22:13:20.123456Z"))),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn round_trips_through_format_iso_z() {
        let t = 1_700_000_000;
        assert_eq!(parse_unix_ts(Some(&json!(format_iso_z(t)))), Some(t));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_unix_ts(Some(&json!("not-a-time"))), None);
    }
}
