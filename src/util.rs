use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are persisted as fixed-width RFC 3339 UTC text so that
/// lexicographic ordering matches chronological ordering on both database
/// backends.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn test_ts_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let s = format_ts(ts);
        assert_eq!(s, "2024-03-01T12:30:45.000000Z");
        assert_eq!(parse_ts(&s), Some(ts));
    }

    #[test]
    fn test_ts_ordering_is_lexicographic() {
        let a = format_ts(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let b = format_ts(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap());
        assert!(a < b);
    }
}
