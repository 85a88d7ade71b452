//! Timestamp parsing shared by the parsers: strftime-style formats, the
//! `"epoch"` pseudo-format for Unix milliseconds, and local/UTC zone
//! handling for formats that carry no offset of their own.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// How to interpret a parsed timestamp that has no explicit offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeZoneKind {
    Local,
    #[default]
    Utc,
}

/// Unix milliseconds, accepted by the JSON parser as `"epoch"`.
pub const EPOCH_FORMAT: &str = "epoch";

/// Parse `value` against `format`, yielding UTC.
///
/// The format string uses chrono's strftime syntax. Formats that include
/// an offset (`%z`/`%:z`) are honored as written; otherwise the result is
/// interpreted per `zone`. Date-only and time-only formats are filled out
/// with midnight and today respectively.
pub fn parse_timestamp(
    value: &str,
    format: &str,
    zone: TimeZoneKind,
) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if format == EPOCH_FORMAT {
        let millis: i64 = value.parse().ok()?;
        return DateTime::from_timestamp_millis(millis);
    }

    if let Ok(with_offset) = DateTime::parse_from_str(value, format) {
        return Some(with_offset.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .or_else(|| {
            NaiveTime::parse_from_str(value, format)
                .ok()
                .map(|time| Utc::now().date_naive().and_time(time))
        })?;

    to_utc(naive, zone)
}

/// Parse a timestamp at the start of `value`, returning it with the rest
/// of the string. Used to recognize record-start lines.
pub fn parse_timestamp_prefix<'a>(
    value: &'a str,
    format: &str,
    zone: TimeZoneKind,
) -> Option<(DateTime<Utc>, &'a str)> {
    let (naive, rest) = NaiveDateTime::parse_and_remainder(value, format).ok()?;
    Some((to_utc(naive, zone)?, rest))
}

fn to_utc(naive: NaiveDateTime, zone: TimeZoneKind) -> Option<DateTime<Utc>> {
    match zone {
        TimeZoneKind::Utc => Some(Utc.from_utc_datetime(&naive)),
        TimeZoneKind::Local => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc)),
    }
}
