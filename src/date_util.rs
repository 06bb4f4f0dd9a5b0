use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Parse a timestamp as the tracker API emits it.
///
/// The API uses a numeric offset without a colon (`2024-03-01T10:15:00.000+0000`),
/// which plain RFC 3339 parsing rejects, so both forms are accepted. Naive
/// timestamps are taken to be UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a timestamp for storage. Fixed width with millisecond precision,
/// so lexical order in SQLite matches chronological order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp column, logging values that cannot be read.
pub fn parse_stored(s: &str) -> Option<DateTime<Utc>> {
    let parsed = parse_timestamp(s);
    if parsed.is_none() {
        log::warn!("Unparseable stored timestamp: {s:?}");
    }
    parsed
}
