use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("date arithmetic overflowed from {0}")]
    Overflow(NaiveDate),
}

/// Parses an IANA zone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Result<Tz, CalendarError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CalendarError::InvalidTimezone(name.to_string()))
}

/// Calendar day of `at` in the program's zone.
pub fn local_day(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// Adds whole months, clamping to the last day of shorter months.
pub fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate, CalendarError> {
    date.checked_add_months(Months::new(months))
        .ok_or(CalendarError::Overflow(date))
}

pub fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, CalendarError> {
    date.checked_add_days(Days::new(days))
        .ok_or(CalendarError::Overflow(date))
}

/// Dates derived for a new enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramDates {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub eligible_from: NaiveDate,
}

pub fn enrollment_dates(
    start: NaiveDate,
    duration_months: u32,
    withdraw_wait_days: u64,
) -> Result<ProgramDates, CalendarError> {
    Ok(ProgramDates {
        start_date: start,
        end_date: add_months(start, duration_months)?,
        eligible_from: add_days(start, withdraw_wait_days)?,
    })
}

/// Whether `day` falls in the accrual window `[start, end)`.
///
/// A missing bound leaves that side open.
pub fn window_contains(start: Option<NaiveDate>, end: Option<NaiveDate>, day: NaiveDate) -> bool {
    let after_start = start.map_or(true, |start| day >= start);
    let before_end = end.map_or(true, |end| day < end);
    after_start && before_end
}

/// ISO week key (`2025-W01`) used to scope weekly digests.
pub fn iso_week_key(day: NaiveDate) -> String {
    let week = day.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}
