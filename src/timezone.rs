//! Conversion between a user's local weekday preference and the UTC slot of the
//! operational dispatch checkpoint.
//!
//! The worker cycle is anchored to a fixed hour in a fixed reference timezone.
//! A user's intended local instant can land on the preceding or following
//! reference-timezone day, so the checkpoint on the same day and both
//! neighbouring days are compared and the closest one wins.
use crate::error::ScheduleError;
use crate::model::{DayOfWeekIndex, HourIndex, IndexedTime};
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Hour and timezone the dispatch cycle is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalTarget {
    pub timezone: Tz,
    pub hour: HourIndex,
}

impl OperationalTarget {
    pub fn new(timezone: &str, hour: i64) -> Result<Self, ScheduleError> {
        Ok(Self {
            timezone: parse_timezone(timezone)?,
            hour: HourIndex::new(hour)?,
        })
    }

    fn time_of_day(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour.value()), 0, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl Default for OperationalTarget {
    fn default() -> Self {
        // Fixed offset rather than US/Eastern keeps day indices stable across DST.
        Self {
            timezone: chrono_tz::Etc::GMTPlus5,
            hour: HourIndex(10),
        }
    }
}

pub fn parse_timezone(iana_timezone: &str) -> Result<Tz, ScheduleError> {
    iana_timezone
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(iana_timezone.to_string()))
}

/// Interpret a wall-clock time in `tz`. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid wall time.
pub(crate) fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt;
    }
    let mut shifted = naive;
    for _ in 0..8 {
        shifted += Duration::minutes(15);
        if let Some(dt) = tz.from_local_datetime(&shifted).earliest() {
            return dt;
        }
    }
    tz.from_utc_datetime(&naive)
}

fn next_date_matching(mut date: NaiveDate, weekday: DayOfWeekIndex) -> Result<NaiveDate, ScheduleError> {
    for _ in 0..7 {
        if weekday.matches(date.weekday()) {
            return Ok(date);
        }
        date = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ScheduleError::InvalidDateOfSend(date.to_string()))?;
    }
    Err(ScheduleError::InvalidDayOfWeek(i64::from(weekday.value())))
}

/// UTC weekday/hour/quarter-hour of the operational checkpoint closest to the
/// user's intended send on `local_weekday` in `iana_timezone`.
pub fn closest_utc_send_time(
    local_weekday: DayOfWeekIndex,
    iana_timezone: &str,
    now: DateTime<Utc>,
    target: &OperationalTarget,
) -> Result<IndexedTime, ScheduleError> {
    let user_tz = parse_timezone(iana_timezone)?;
    let local_date = next_date_matching(now.with_timezone(&user_tz).date_naive(), local_weekday)?;
    let intended = localize(&user_tz, local_date.and_time(target.time_of_day()));

    let operational_date = intended.with_timezone(&target.timezone).date_naive();
    let same_day = localize(&target.timezone, operational_date.and_time(target.time_of_day()));

    let distance = |candidate: &DateTime<Tz>| (candidate.clone() - intended.clone()).num_milliseconds().abs();
    let mut closest = same_day.clone();
    let mut closest_distance = distance(&same_day);
    for offset_days in [-1_i64, 1] {
        let candidate = same_day.clone() + Duration::days(offset_days);
        let candidate_distance = distance(&candidate);
        if candidate_distance < closest_distance {
            closest = candidate;
            closest_distance = candidate_distance;
        }
    }
    Ok(IndexedTime::from_datetime(&closest.with_timezone(&Utc)))
}

/// Inverse of [`closest_utc_send_time`]: read a stored UTC slot in the user's timezone.
pub fn convert_indexed_utc_to_user_timezone(
    indexed_utc: IndexedTime,
    iana_timezone: &str,
    now: DateTime<Utc>,
) -> Result<IndexedTime, ScheduleError> {
    let user_tz = parse_timezone(iana_timezone)?;
    let utc_date = next_date_matching(now.date_naive(), indexed_utc.day_of_week)?;
    let time = NaiveTime::from_hms_opt(
        u32::from(indexed_utc.hour.value()),
        indexed_utc.quarter_hour.minutes(),
        0,
    )
    .unwrap_or(NaiveTime::MIN);
    let utc_instant = Utc.from_utc_datetime(&utc_date.and_time(time));
    Ok(IndexedTime::from_datetime(&utc_instant.with_timezone(&user_tz)))
}
