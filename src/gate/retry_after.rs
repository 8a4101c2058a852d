//! `Retry-After` parsing.
//!
//! Upstream sends either a delay in seconds (`"30"`, `"1.5"`) or an HTTP-date
//! (`"Wed, 21 Oct 2026 07:28:00 GMT"`). The numeric form wins when it parses.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Obsolete HTTP-date layouts that still show up behind older gateways:
/// RFC 850 and ANSI C `asctime()`.
const LEGACY_HTTP_DATE_FORMATS: [&str; 2] = ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"];

/// Parse a `Retry-After` header value into a delay relative to `now`.
///
/// Returns `None` when the value is neither a finite number nor a date.
/// Negative delays and dates in the past collapse to [`Duration::ZERO`].
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Some(delay) = parse_delay_seconds(value) {
        return Some(delay);
    }
    parse_http_date(value).map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
}

fn parse_delay_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    if secs <= 0.0 {
        return Some(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    // IMF-fixdate is a strict subset of RFC 2822, including the "GMT" zone.
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    LEGACY_HTTP_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
