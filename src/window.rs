//! Time window resolution and bucket truncation.
//!
//! Every timestamp leaving this module is an absolute instant
//! (`DateTime<Utc>`). Bucket boundaries are computed in an explicit civil
//! time zone passed by the caller; there is no implicit local zone.

use std::fmt;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ---

/// Requested dashboard period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    /// Parse a period name, falling back to `Day` for anything unknown.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        // ---
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("hour") => Period::Hour,
            Some("day") => Period::Day,
            Some("week") => Period::Week,
            Some("month") => Period::Month,
            Some("year") => Period::Year,
            other => {
                if let Some(other) = other {
                    tracing::debug!(period = other, "unknown period, using day defaults");
                }
                Period::Day
            }
        }
    }

    pub fn default_length(self) -> Duration {
        match self {
            Period::Hour => Duration::hours(1),
            Period::Day => Duration::days(1),
            Period::Week => Duration::days(7),
            Period::Month => Duration::days(30),
            Period::Year => Duration::days(365),
        }
    }

    pub fn default_bucket(self) -> Granularity {
        match self {
            Period::Hour => Granularity::Minute,
            Period::Day => Granularity::Hour,
            Period::Week | Period::Month => Granularity::Day,
            Period::Year => Granularity::Month,
        }
    }
}

/// Bucket width. Nothing finer than a minute exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Unit name understood by Postgres `date_trunc`.
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        // ---
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Granularity,
}

impl TimeWindow {
    /// An inverted window selects nothing; callers answer it with an empty result.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Raw window request as it arrives from a caller.
#[derive(Debug, Clone, Default)]
pub struct WindowRequest<'a> {
    pub period: Option<&'a str>,
    pub interval: Option<&'a str>,
    pub start: Option<&'a str>,
    pub end: Option<&'a str>,
}

/// Compute `(start, end, bucket)` for a request.
///
/// `end` defaults to `now`, `start` to `end - period length`. An explicit
/// `interval` overrides the period's bucket when it names a known granularity.
pub fn resolve(req: &WindowRequest<'_>, now: DateTime<Utc>, tz: Tz) -> CoreResult<TimeWindow> {
    // ---
    let period = Period::parse_lenient(req.period);

    let bucket = match req.interval.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Granularity::parse(raw).unwrap_or_else(|| {
            tracing::debug!(interval = raw, "unknown interval, using period default");
            period.default_bucket()
        }),
        None => period.default_bucket(),
    };

    let end = match req.end {
        Some(raw) => parse_instant(raw, tz)?,
        None => now,
    };
    let start = match req.start {
        Some(raw) => parse_instant(raw, tz)?,
        None => end - period.default_length(),
    };

    Ok(TimeWindow { start, end, bucket })
}

/// Parse a caller timestamp into an absolute instant.
///
/// RFC 3339 values carry their own offset. Naive values (`YYYY-MM-DD`,
/// `YYYY-MM-DDTHH:MM[:SS[.f]]`, or with a space separator) are read as wall
/// time in `tz`.
pub fn parse_instant(raw: &str, tz: Tz) -> CoreResult<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| CoreError::validation(format!("invalid timestamp: {raw}")))?;

    Ok(localize(naive, tz))
}

/// Truncate `ts` to the start of its `bucket` in civil zone `tz`.
///
/// minute: zero seconds/subseconds; hour: zero minutes and below; day: zero
/// time of day; month: first day, zero time; year: January 1st, zero time.
///
/// Minute and hour buckets keep the UTC offset in force at `ts`, so the two
/// occurrences of a repeated wall-clock hour stay separate buckets. Day and
/// coarser buckets re-resolve the offset at the bucket start, matching
/// Postgres' `date_trunc(field, ts, zone)`.
pub fn truncate(ts: DateTime<Utc>, bucket: Granularity, tz: Tz) -> DateTime<Utc> {
    // ---
    let local = ts.with_timezone(&tz);
    let own = local.offset().fix();
    let naive = truncate_naive(local.naive_local(), bucket);

    match bucket {
        Granularity::Minute | Granularity::Hour => at_offset(naive, own),
        Granularity::Day | Granularity::Month | Granularity::Year => {
            match tz.from_local_datetime(&naive) {
                LocalResult::Single(start) => start.with_timezone(&Utc),
                // Repeated midnight: the occurrence sharing the offset of `ts`
                // never lies after it.
                LocalResult::Ambiguous(early, late) => {
                    let start = if early.offset().fix() == own { early } else { late };
                    start.with_timezone(&Utc)
                }
                LocalResult::None => across_gap(naive, tz),
            }
        }
    }
}

fn truncate_naive(local: NaiveDateTime, bucket: Granularity) -> NaiveDateTime {
    // ---
    let date = local.date();
    let (date, hour, minute) = match bucket {
        Granularity::Minute => (date, local.hour(), local.minute()),
        Granularity::Hour => (date, local.hour(), 0),
        Granularity::Day => (date, 0, 0),
        Granularity::Month => (date.with_day(1).unwrap_or(date), 0, 0),
        Granularity::Year => (
            NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
            0,
            0,
        ),
    };
    date.and_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN))
}

/// Map civil wall time to an instant. Ambiguous times take the earlier
/// instant; times inside a DST gap use the offset in force before it.
fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    // ---
    match tz.from_local_datetime(&naive).earliest() {
        Some(ts) => ts.with_timezone(&Utc),
        None => across_gap(naive, tz),
    }
}

fn across_gap(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    // ---
    let before = naive - Duration::days(1);
    let offset = tz.offset_from_utc_datetime(&before).fix();
    at_offset(naive, offset)
}

fn at_offset(naive: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    // ---
    let utc = naive - Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono_tz::America::Lima;
    use chrono_tz::Europe::Madrid;

    const ALL: [Granularity; 5] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Month,
        Granularity::Year,
    ];

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_period_defaults() {
        // ---
        assert_eq!(Period::Hour.default_bucket(), Granularity::Minute);
        assert_eq!(Period::Day.default_bucket(), Granularity::Hour);
        assert_eq!(Period::Week.default_bucket(), Granularity::Day);
        assert_eq!(Period::Month.default_bucket(), Granularity::Day);
        assert_eq!(Period::Year.default_bucket(), Granularity::Month);
        assert_eq!(Period::Week.default_length(), Duration::days(7));
        assert_eq!(Period::Year.default_length(), Duration::days(365));
    }

    #[test]
    fn test_unknown_period_falls_back_to_day() {
        // ---
        assert_eq!(Period::parse_lenient(Some("fortnight")), Period::Day);
        assert_eq!(Period::parse_lenient(None), Period::Day);
        assert_eq!(Period::parse_lenient(Some(" MONTH ")), Period::Month);
    }

    #[test]
    fn test_resolve_defaults_end_to_now() {
        // ---
        let now = at(2025, 3, 26, 18, 45, 0);
        let req = WindowRequest {
            period: Some("week"),
            ..Default::default()
        };
        let window = resolve(&req, now, Lima).unwrap();
        assert_eq!(window.end, now);
        assert_eq!(window.start, now - Duration::days(7));
        assert_eq!(window.bucket, Granularity::Day);
    }

    #[test]
    fn test_resolve_interval_override() {
        // ---
        let now = at(2025, 3, 26, 18, 45, 0);
        let req = WindowRequest {
            period: Some("hour"),
            interval: Some("hour"),
            ..Default::default()
        };
        assert_eq!(resolve(&req, now, Lima).unwrap().bucket, Granularity::Hour);

        let req = WindowRequest {
            period: Some("hour"),
            interval: Some("second"),
            ..Default::default()
        };
        assert_eq!(resolve(&req, now, Lima).unwrap().bucket, Granularity::Minute);
    }

    #[test]
    fn test_inverted_window_is_empty_not_error() {
        // ---
        let now = at(2025, 3, 26, 18, 45, 0);
        let req = WindowRequest {
            period: Some("day"),
            start: Some("2025-03-26T12:00:00Z"),
            end: Some("2025-03-26T10:00:00Z"),
            ..Default::default()
        };
        let window = resolve(&req, now, Lima).unwrap();
        assert!(window.is_empty());
    }

    #[test]
    fn test_naive_timestamp_uses_field_zone() {
        // ---
        // Lima is UTC-5 all year.
        let ts = parse_instant("2025-03-26 10:00:00", Lima).unwrap();
        assert_eq!(ts, at(2025, 3, 26, 15, 0, 0));

        let ts = parse_instant("2025-03-26", Lima).unwrap();
        assert_eq!(ts, at(2025, 3, 26, 5, 0, 0));

        let ts = parse_instant("2025-03-26T10:00:00+00:00", Lima).unwrap();
        assert_eq!(ts, at(2025, 3, 26, 10, 0, 0));
    }

    #[test]
    fn test_invalid_timestamp_is_validation_error() {
        // ---
        let err = parse_instant("yesterday", Lima).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_truncation_rules_in_utc() {
        // ---
        let ts = at(2025, 7, 14, 10, 37, 42) + Duration::microseconds(123_456);
        let tz = chrono_tz::UTC;
        assert_eq!(truncate(ts, Granularity::Minute, tz), at(2025, 7, 14, 10, 37, 0));
        assert_eq!(truncate(ts, Granularity::Hour, tz), at(2025, 7, 14, 10, 0, 0));
        assert_eq!(truncate(ts, Granularity::Day, tz), at(2025, 7, 14, 0, 0, 0));
        assert_eq!(truncate(ts, Granularity::Month, tz), at(2025, 7, 1, 0, 0, 0));
        assert_eq!(truncate(ts, Granularity::Year, tz), at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_day_boundary_follows_field_zone() {
        // ---
        // 03:00 UTC is still the previous day in Lima.
        let ts = at(2025, 7, 14, 3, 0, 0);
        assert_eq!(truncate(ts, Granularity::Day, Lima), at(2025, 7, 13, 5, 0, 0));
    }

    #[test]
    fn test_truncate_is_idempotent_and_not_after_input() {
        // ---
        let samples = [
            at(2025, 1, 1, 0, 0, 0),
            at(2025, 3, 30, 0, 59, 59),
            at(2025, 3, 30, 1, 30, 0),
            at(2025, 10, 26, 0, 30, 0),
            at(2025, 10, 26, 1, 30, 0),
            at(2024, 2, 29, 23, 59, 59) + Duration::microseconds(999_999),
            at(2025, 12, 31, 23, 0, 1),
        ];
        for tz in [Lima, Madrid, chrono_tz::UTC] {
            for ts in samples {
                for g in ALL {
                    let once = truncate(ts, g, tz);
                    assert!(once <= ts, "{g} {tz} {ts}: {once} after input");
                    assert_eq!(truncate(once, g, tz), once, "{g} {tz} {ts}");
                }
            }
        }
    }

    #[test]
    fn test_repeated_hour_stays_two_buckets() {
        // ---
        // 2025-10-26 in Madrid: 02:00-03:00 local happens at +02:00 then +01:00.
        let first = at(2025, 10, 26, 0, 30, 0);
        let second = at(2025, 10, 26, 1, 30, 0);
        assert_eq!(truncate(first, Granularity::Hour, Madrid), at(2025, 10, 26, 0, 0, 0));
        assert_eq!(truncate(second, Granularity::Hour, Madrid), at(2025, 10, 26, 1, 0, 0));
        assert_eq!(truncate(second, Granularity::Minute, Madrid), second);
        assert_eq!(truncate(second, Granularity::Day, Madrid), at(2025, 10, 25, 22, 0, 0));
    }

    #[test]
    fn test_spring_forward_hour_buckets() {
        // ---
        // 2025-03-30 in Madrid: 02:00 local jumps to 03:00.
        let before = at(2025, 3, 30, 0, 45, 0);
        let after = at(2025, 3, 30, 1, 15, 0);
        assert_eq!(truncate(before, Granularity::Hour, Madrid), at(2025, 3, 30, 0, 0, 0));
        assert_eq!(truncate(after, Granularity::Hour, Madrid), at(2025, 3, 30, 1, 0, 0));
        assert_eq!(truncate(after, Granularity::Day, Madrid), at(2025, 3, 29, 23, 0, 0));
    }

    #[test]
    fn test_naive_time_in_gap_uses_offset_before_it() {
        // ---
        let ts = parse_instant("2025-03-30T02:30:00", Madrid).unwrap();
        assert_eq!(ts, at(2025, 3, 30, 1, 30, 0));
    }
}
