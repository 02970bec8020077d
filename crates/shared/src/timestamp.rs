//! Provider timestamp normalization
//!
//! Stripe events and stored records reach us with timestamps in several wire
//! shapes: integer epoch seconds (the provider's native form), epoch
//! milliseconds (older records written by a previous backend), and RFC 3339
//! strings (manually replayed events). Everything past the store boundary
//! works in a single canonical `OffsetDateTime`; this module is the only
//! place that knows about the other shapes.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Epoch values at or above this are treated as milliseconds.
///
/// 100_000_000_000 seconds is the year 5138; 100_000_000_000 milliseconds is
/// March 1973. No value this system handles is ambiguous across that line.
const MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Normalize a wire timestamp into a canonical `OffsetDateTime`.
///
/// Accepts epoch seconds, epoch milliseconds, or an RFC 3339 string.
/// Returns `None` for shapes that cannot be interpreted; callers decide
/// whether that means "fall back to now" or "field absent".
pub fn normalize_event_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            from_epoch(raw)
        }
        Value::String(s) => {
            if let Ok(parsed) = OffsetDateTime::parse(s, &Rfc3339) {
                return Some(parsed);
            }
            // Epoch-as-string shows up in query params and replay tooling.
            let raw: i64 = s.parse().ok()?;
            from_epoch(raw)
        }
        _ => None,
    }
}

/// Normalize a raw epoch integer (seconds or milliseconds).
pub fn from_epoch(raw: i64) -> Option<OffsetDateTime> {
    let seconds = if raw.abs() >= MILLIS_CUTOFF {
        raw / 1000
    } else {
        raw
    };
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn epoch_seconds_pass_through() {
        let ts = normalize_event_timestamp(&json!(1_700_000_000)).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn epoch_millis_are_scaled_down() {
        let ts = normalize_event_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn rfc3339_strings_parse() {
        let ts = normalize_event_timestamp(&json!("2024-05-01T12:30:00Z")).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_714_566_600);
    }

    #[test]
    fn epoch_string_parses() {
        let ts = normalize_event_timestamp(&json!("1700000000")).unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn garbage_is_none() {
        assert!(normalize_event_timestamp(&json!("not a time")).is_none());
        assert!(normalize_event_timestamp(&json!(null)).is_none());
        assert!(normalize_event_timestamp(&json!({"t": 1})).is_none());
    }
}
