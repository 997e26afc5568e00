//! Timestamp parsing and display formatting.

use chrono::{DateTime, Datelike, Local};

/// Parse an ISO-8601 timestamp (the `createdAt` format). Returns None on
/// anything malformed.
pub fn decode_isotime(s: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Local))
}

/// Today: time only. This year: month/day + time. Older: date, no seconds.
pub fn format_time(t: DateTime<Local>) -> String {
    format_time_at(t, Local::now())
}

fn format_time_at(t: DateTime<Local>, now: DateTime<Local>) -> String {
    if t.year() == now.year() && t.ordinal() == now.ordinal() {
        t.format("%H:%M:%S").to_string()
    } else if t.year() == now.year() {
        t.format("%m/%d %H:%M:%S").to_string()
    } else {
        t.format("%Y/%m/%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_utc_and_offsets() {
        assert!(decode_isotime("2024-03-01T12:34:56.000Z").is_some());
        assert!(decode_isotime("2024-03-01T12:34:56+09:00").is_some());
        assert!(decode_isotime("not a time").is_none());
    }

    #[test]
    fn recency_picks_format() {
        let now = Local.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap();
        let today = Local.with_ymd_and_hms(2025, 6, 15, 9, 30, 5).unwrap();
        let this_year = Local.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let old = Local.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(format_time_at(today, now), "09:30:05");
        assert_eq!(format_time_at(this_year, now), "01/02 03:04:05");
        assert_eq!(format_time_at(old, now), "2023/12/31 23:59");
    }
}
