//! `created_at` parsing and UTC normalization.
//!
//! Accepts RFC 3339, the common ISO-8601 variants (space separator, missing
//! seconds, compact or hour-only offsets, comma decimals, basic format,
//! date-only) and a trailing literal `Z`. Values without an offset are taken
//! to already be UTC. Results are truncated to microseconds, the resolution of
//! `timestamptz`, so keys read back from the store compare equal to the ones
//! we staged. Only years 1 through 9999 are accepted.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use std::ops::RangeInclusive;

use super::record::RawTimestamp;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y%m%dT%H%M%S%.f",
    "%Y%m%dT%H%M",
];

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M%#z",
    "%Y-%m-%d %H:%M%#z",
    "%Y%m%dT%H%M%S%.f%#z",
    "%Y%m%dT%H%M%#z",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];

const STORABLE_YEARS: RangeInclusive<i32> = 1..=9999;

pub fn normalize_created_at(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    let utc = match raw {
        RawTimestamp::Zoned(dt) => dt.with_timezone(&Utc),
        RawTimestamp::Naive(naive) => naive.and_utc(),
        RawTimestamp::Text(text) => parse_iso8601(text)?,
        RawTimestamp::Absent | RawTimestamp::Unrecognized => return None,
    };
    if !STORABLE_YEARS.contains(&utc.year()) {
        return None;
    }
    Some(utc.trunc_subsecs(6))
}

/// Parses ISO-8601 text into UTC. `None` when no accepted form matches.
pub fn parse_iso8601(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() || text.contains('\0') {
        return None;
    }
    let text = &text.replace(',', ".");
    // A literal Z marks UTC; what precedes it must carry no offset of its own.
    if let Some(stripped) = text.strip_suffix('Z') {
        return parse_naive(stripped).map(|naive| naive.and_utc());
    }
    if let Some(zoned) = parse_zoned(text) {
        return Some(zoned.with_timezone(&Utc));
    }
    parse_naive(text).map(|naive| naive.and_utc())
}

fn parse_zoned(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    ZONED_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        return Some(naive);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}
