//! Cron expression parsing and evaluation.
//!
//! Supported syntax:
//!
//! - 5 fields: `minute hour day-of-month month day-of-week`
//! - 6 fields: `second minute hour day-of-month month day-of-week`
//! - `*` and `?`, single values, ranges `a-b`, steps `*/n`, `a-b/n` and `a/n`,
//!   comma-separated lists
//! - month names `JAN`-`DEC` and weekday names `SUN`-`SAT` (case-insensitive);
//!   `0` and `7` both mean Sunday
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either does (the classic cron rule). A field counts as unrestricted when
//! it starts with `*` or is `?`.
//!
//! Evaluation happens on local wall-clock time in the schedule's timezone.
//! Local times that do not exist (DST gap) are skipped; local times that occur
//! twice (DST fold) fire once, at the earlier instant.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, ErrorCode, Result};

/// How far ahead `next_after` searches before giving up (covers leap-day schedules).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

// ═══════════════════════════════════════════════════════════════════════════════
// Field sets
// ═══════════════════════════════════════════════════════════════════════════════

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }

    /// Smallest member `>= from`.
    fn next_from(&self, from: u32) -> Option<u32> {
        if from >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << from);
        (masked != 0).then(|| masked.trailing_zeros())
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy)]
enum FieldKind {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day-of-month",
            Self::Month => "month",
            Self::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive bounds accepted in the expression.
    fn bounds(&self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            // 7 is accepted and folded onto 0
            Self::DayOfWeek => (0, 7),
        }
    }

    fn parse_value(&self, token: &str) -> Option<u32> {
        if let Ok(n) = token.parse::<u32>() {
            return Some(n);
        }
        let upper = token.to_ascii_uppercase();
        let names: &[&str] = match self {
            Self::Month => &[
                "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
            ],
            Self::DayOfWeek => &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
            _ => return None,
        };
        let offset = if matches!(self, Self::Month) { 1 } else { 0 };
        names
            .iter()
            .position(|n| *n == upper)
            .map(|i| i as u32 + offset)
    }
}

fn invalid(expression: &str, reason: impl fmt::Display) -> CoreError {
    CoreError::new(
        ErrorCode::InvalidCronExpression,
        format!("Invalid cron expression '{}': {}", expression, reason),
    )
    .with_context("expression", expression)
}

fn parse_field(expression: &str, field: &str, kind: FieldKind) -> Result<FieldSet> {
    let (min, max) = kind.bounds();
    let mut set = FieldSet(0);

    for item in field.split(',') {
        if item.is_empty() {
            return Err(invalid(expression, format!("empty list item in {} field", kind.name())));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    invalid(expression, format!("bad step '{}' in {} field", step, kind.name()))
                })?;
                if step == 0 {
                    return Err(invalid(expression, format!("zero step in {} field", kind.name())));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let value = |token: &str| -> Result<u32> {
            let v = kind.parse_value(token).ok_or_else(|| {
                invalid(expression, format!("bad value '{}' in {} field", token, kind.name()))
            })?;
            if v < min || v > max {
                return Err(invalid(
                    expression,
                    format!("{} out of range {}-{} in {} field", v, min, max, kind.name()),
                ));
            }
            Ok(v)
        };

        let has_step = item.contains('/');
        let (start, end) = match range {
            "*" | "?" => (min, max),
            _ => match range.split_once('-') {
                Some((a, b)) => (value(a)?, value(b)?),
                // `a/n` runs from a to the top of the range
                None if has_step => (value(range)?, max),
                None => {
                    let v = value(range)?;
                    (v, v)
                }
            },
        };
        if start > end {
            return Err(invalid(
                expression,
                format!("descending range {}-{} in {} field", start, end, kind.name()),
            ));
        }

        let mut v = start;
        while v <= end {
            match kind {
                FieldKind::DayOfWeek => set.insert(v % 7),
                _ => set.insert(v),
            }
            v += step;
        }
    }

    if set.is_empty() {
        return Err(invalid(expression, format!("{} field matches nothing", kind.name())));
    }
    Ok(set)
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cron expression
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(invalid(
                    expression,
                    format!("expected 5 or 6 fields, found {}", n),
                ))
            }
        };

        Ok(Self {
            source: expression.trim().to_string(),
            seconds: parse_field(expression, second, FieldKind::Second)?,
            minutes: parse_field(expression, rest[0], FieldKind::Minute)?,
            hours: parse_field(expression, rest[1], FieldKind::Hour)?,
            days_of_month: parse_field(expression, rest[2], FieldKind::DayOfMonth)?,
            months: parse_field(expression, rest[3], FieldKind::Month)?,
            days_of_week: parse_field(expression, rest[4], FieldKind::DayOfWeek)?,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether a local wall-clock time matches every field.
    pub fn matches_local(&self, local: &NaiveDateTime) -> bool {
        self.months.contains(local.month())
            && self.day_matches(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
            && self.seconds.contains(local.second())
    }

    /// The first occurrence strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.with_nanosecond(0)? + Duration::seconds(1);
        let horizon = local + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= horizon {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = match self.hours.next_from(t.hour() + 1) {
                    Some(h) => t.date().and_hms_opt(h, 0, 0)?,
                    None => t.date().succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = match self.minutes.next_from(t.minute() + 1) {
                    Some(m) => t.date().and_hms_opt(t.hour(), m, 0)?,
                    None => t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1),
                };
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t = match self.seconds.next_from(t.second() + 1) {
                    Some(s) => t.date().and_hms_opt(t.hour(), t.minute(), s)?,
                    None => t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1),
                };
                continue;
            }

            match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => {
                    let utc = dt.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
                LocalResult::Ambiguous(earliest, _) => {
                    let utc = earliest.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                }
                LocalResult::None => {}
            }
            t += Duration::seconds(1);
        }

        None
    }

    /// Occurrences in `[from, to]`, in order.
    pub fn occurrences(&self, from: DateTime<Utc>, to: DateTime<Utc>, tz: Tz) -> Occurrences<'_> {
        Occurrences {
            expression: self,
            tz,
            cursor: from - Duration::seconds(1),
            from,
            to,
        }
    }

    /// The latest occurrence in `(after, until]`, if any.
    ///
    /// Searches backwards from `until` in doubling windows, so a long gap since
    /// `after` does not mean walking every missed occurrence.
    pub fn latest_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        if until <= after {
            return None;
        }

        let mut window = Duration::hours(1);
        loop {
            let start = until
                .checked_sub_signed(window)
                .map_or(after, |s| s.max(after));

            let mut latest = None;
            let mut cursor = start;
            while let Some(next) = self.next_after(cursor, tz) {
                if next > until {
                    break;
                }
                latest = Some(next);
                cursor = next;
            }

            if latest.is_some() || start == after {
                return latest;
            }
            window = window.checked_mul(2).unwrap_or(Duration::MAX);
        }
    }

    /// The latest occurrence at or before `now`, looking back at most `lookback`.
    pub fn current_period(&self, now: DateTime<Utc>, lookback: Duration, tz: Tz) -> Option<DateTime<Utc>> {
        let after = now.checked_sub_signed(lookback)?;
        self.latest_between(after, now, tz)
    }
}

impl FromStr for CronExpression {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Iterator over occurrences in a closed range.
pub struct Occurrences<'a> {
    expression: &'a CronExpression,
    tz: Tz,
    cursor: DateTime<Utc>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next = self.expression.next_after(self.cursor, self.tz)?;
            if next > self.to {
                return None;
            }
            self.cursor = next;
            if next >= self.from {
                return Some(next);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Free functions
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>().map_err(|_| {
        CoreError::new(
            ErrorCode::InvalidTimezone,
            format!("Unknown timezone '{}'", name),
        )
        .with_suggestion("Use an IANA timezone name such as 'UTC' or 'America/New_York'")
    })
}

/// The next time `expression` fires strictly after `now` in `timezone`.
pub fn next_due_time(expression: &str, timezone: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = CronExpression::parse(expression)?;
    let tz = parse_timezone(timezone)?;
    cron.next_after(now, tz).ok_or_else(|| {
        invalid(
            expression,
            format!("no occurrence within {} days", SEARCH_HORIZON_DAYS),
        )
    })
}
