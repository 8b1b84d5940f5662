use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Point in time with an explicit offset. Stored UTC-normalized as TEXT,
/// compared in absolute time regardless of the offset it arrived with.
#[derive(Serialize, Deserialize, PartialEq, PartialOrd, Debug, Clone, Copy)]
pub struct SbDateTime(pub DateTime<FixedOffset>);

impl SbDateTime {
    pub fn now() -> Self {
        Self(Utc::now().fixed_offset()).trimmed_to_sec()
    }
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt.fixed_offset())
    }
    pub fn to_utc(self) -> DateTime<Utc> {
        self.0.to_utc()
    }
    pub fn trimmed_to_sec(&self) -> Self {
        let nanos = self.0.timestamp_subsec_nanos();
        if let Some(dt) = self.0.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)) {
            SbDateTime(dt)
        } else {
            *self
        }
    }
    pub fn to_iso_string(self) -> String {
        if self.0.timestamp_subsec_millis() == 0 {
            self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
        } else {
            self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    }
    pub fn from_iso_string(datetime_str: &str) -> Result<Self, anyhow::Error> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
            return Ok(Self(dt));
        }
        // sqlx encodes chrono values with a space separator
        let dt = DateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f%:z")?;
        Ok(Self(dt))
    }
}

impl From<DateTime<FixedOffset>> for SbDateTime {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self(value)
    }
}
impl From<DateTime<Utc>> for SbDateTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self::from_utc(value)
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for SbDateTime
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for SbDateTime
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(SbDateTime::from_iso_string(value)?)
    }
}

/// Today, midnight to midnight.
pub(crate) fn day_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    (start, start + TimeDelta::days(1))
}

/// The current Sunday-start week.
pub(crate) fn week_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let days_since_sunday = now.weekday().num_days_from_sunday() as u64;
    let sunday = now.date_naive() - Days::new(days_since_sunday);
    let start = sunday.and_time(NaiveTime::MIN).and_utc();
    (start, start + TimeDelta::days(7))
}

/// First of the current month to first of the next.
pub(crate) fn month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = now.date_naive();
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("valid date");
    let next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
    .expect("valid date");
    (
        first.and_time(NaiveTime::MIN).and_utc(),
        next.and_time(NaiveTime::MIN).and_utc(),
    )
}

#[test]
fn test_trimmed_to_sec() {
    let dt = SbDateTime::now().trimmed_to_sec();
    assert_eq!(dt.0.timestamp_subsec_nanos(), 0);
}

#[test]
fn test_parse_sbdatetime() {
    for (dtstr, dtstr2) in &[
        ("1970-03-05T14:32:45Z", "1970-03-05T14:32:45Z"),
        ("2025-03-05T14:32:45Z", "2025-03-05T14:32:45Z"),
        ("2025-03-05T14:32:45+10:00", "2025-03-05T14:32:45+10:00"),
        ("2025-03-05T14:32:45-01:30", "2025-03-05T14:32:45-01:30"),
        ("2025-03-05 14:32:45+00:00", "2025-03-05T14:32:45Z"),
        ("2025-03-17 21:27:04.095+01:00", "2025-03-17T21:27:04.095+01:00"),
    ] {
        let dt = SbDateTime::from_iso_string(dtstr)
            .map_err(|e| println!("parse {dtstr} error: {e}")).unwrap();
        assert_eq!(&dt.to_iso_string(), dtstr2)
    }
}

#[test]
fn test_offsets_compare_in_absolute_time() {
    let a = SbDateTime::from_iso_string("2025-03-05T14:00:00+02:00").unwrap();
    let b = SbDateTime::from_iso_string("2025-03-05T12:00:00Z").unwrap();
    assert_eq!(a.to_utc(), b.to_utc());
    let later = SbDateTime::from_iso_string("2025-03-05T12:00:01Z").unwrap();
    assert!(later > a);
}

#[cfg(test)]
mod window_tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        SbDateTime::from_iso_string(s).unwrap().to_utc()
    }

    #[test]
    fn test_day_window() {
        let (from, to) = day_window(utc("2025-03-05T14:32:45Z"));
        assert_eq!(from, utc("2025-03-05T00:00:00Z"));
        assert_eq!(to, utc("2025-03-06T00:00:00Z"));
    }

    #[test]
    fn test_week_window_starts_sunday() {
        // 2025-03-05 is a Wednesday
        let (from, to) = week_window(utc("2025-03-05T14:32:45Z"));
        assert_eq!(from, utc("2025-03-02T00:00:00Z"));
        assert_eq!(to, utc("2025-03-09T00:00:00Z"));
        // a Sunday is its own week start
        let (from, _) = week_window(utc("2025-03-02T00:00:00Z"));
        assert_eq!(from, utc("2025-03-02T00:00:00Z"));
    }

    #[test]
    fn test_month_window_december_rolls_over() {
        let (from, to) = month_window(utc("2025-12-31T23:59:59Z"));
        assert_eq!(from, utc("2025-12-01T00:00:00Z"));
        assert_eq!(to, utc("2026-01-01T00:00:00Z"));
    }
}
