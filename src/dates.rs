//! ISO-8601 timestamp parsing shared by date windows and snippet utilities.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses an RFC 3339 timestamp, a naive date-time (read as UTC), or a bare
/// date (read as midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_with_day_time(raw, NaiveTime::from_hms_opt(0, 0, 0)?)
}

/// Like [`parse_timestamp`], but a bare date means the last instant of that
/// day, so `end = 2025-06-30` includes records created during June 30th.
pub fn parse_range_end(raw: &str) -> Option<DateTime<Utc>> {
    let end_of_day = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)?;
    parse_with_day_time(raw, end_of_day)
}

fn parse_with_day_time(raw: &str, day_time: NaiveTime) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|date| date.and_time(day_time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rfc3339_with_zulu() {
        let parsed = parse_timestamp("2025-06-15T10:30:00Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 6, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_rfc3339_with_offset() {
        let parsed = parse_timestamp("2025-06-15T12:30:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 6, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_naive_and_date_only() {
        assert_eq!(
            parse_timestamp("2025-06-15 08:00:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 15, 8, 0, 0).unwrap()
        );
        assert_eq!(
            parse_timestamp("2025-06-01").unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_range_end_covers_whole_day() {
        let end = parse_range_end("2025-06-30").unwrap();
        assert!(end > Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap());
        assert!(end < Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());

        // explicit times are kept as given
        let exact = parse_range_end("2025-06-30T12:00:00Z").unwrap();
        assert_eq!(exact, Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("last tuesday").is_none());
        assert!(parse_timestamp("2025-13-40").is_none());
    }
}
