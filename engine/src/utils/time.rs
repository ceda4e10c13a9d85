//! Time utility functions

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Format a timestamp for a backend query string (millisecond precision, `Z` suffix)
pub fn to_query_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Offset a timestamp by a span duration in milliseconds, saturating on overflow
pub fn add_millis(dt: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
    dt.checked_add_signed(Duration::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert a std duration into a chrono one, saturating on overflow
pub fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_to_query_timestamp() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(to_query_timestamp(dt), "2025-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_add_millis() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let later = add_millis(dt, 1_500);
        assert_eq!((later - dt).num_milliseconds(), 1_500);
    }

    #[test]
    fn test_add_millis_saturates() {
        assert_eq!(add_millis(DateTime::<Utc>::MAX_UTC, 1), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_chrono_duration() {
        let d = chrono_duration(std::time::Duration::from_secs(30));
        assert_eq!(d.num_seconds(), 30);
    }
}
