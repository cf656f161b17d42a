//! Habit scheduling
//!
//! Day-of-week patterns for habit reminders, the "due today" filter,
//! and the reminder dispatcher driven by the worker tick.

pub mod reminders;

pub use reminders::{ReminderDispatcher, ReminderReport};

use crate::error::ImpulsesError;
use crate::models::{Habit, User};
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ALL_DAYS: u8 = 0b111_1111;
const WEEKDAYS: u8 = 0b001_1111;
const WEEKEND: u8 = 0b110_0000;

/// Set of ISO weekdays (Monday = 1 .. Sunday = 7) a habit fires on.
///
/// Accepted forms: `"3"`, `"1-5"`, `"1,3,5"`, `"*"`, `"everyday"`,
/// `"weekday"`, `"weekend"`. The plurals `"weekdays"` and `"weekends"`
/// are aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayPattern {
    raw: String,
    mask: u8,
}

impl DayPattern {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim().to_lowercase();

        let mask = match raw.as_str() {
            "" => {
                return Err(ImpulsesError::InvalidDayPattern(
                    "empty pattern".to_string(),
                ))
            }
            "*" | "everyday" => ALL_DAYS,
            "weekday" | "weekdays" => WEEKDAYS,
            "weekend" | "weekends" => WEEKEND,
            s if s.contains('-') => {
                let (start, end) = s.split_once('-').unwrap_or((s, s));
                let start = parse_day(start)?;
                let end = parse_day(end)?;
                if start > end {
                    return Err(ImpulsesError::InvalidDayPattern(format!(
                        "reversed range '{}'",
                        s
                    )));
                }
                (start..=end).fold(0, |mask, day| mask | bit(day))
            }
            s if s.contains(',') => {
                let mut mask = 0;
                for part in s.split(',') {
                    mask |= bit(parse_day(part)?);
                }
                mask
            }
            s => bit(parse_day(s)?),
        };

        Ok(Self { raw, mask })
    }

    pub fn everyday() -> Self {
        Self {
            raw: "everyday".to_string(),
            mask: ALL_DAYS,
        }
    }

    /// ISO day number, Monday = 1
    pub fn contains_day(&self, day: u8) -> bool {
        (1..=7).contains(&day) && self.mask & bit(day) != 0
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        self.contains_day(weekday.number_from_monday() as u8)
    }

    /// Days in ascending order
    pub fn days(&self) -> Vec<u8> {
        (1..=7).filter(|day| self.contains_day(*day)).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn bit(day: u8) -> u8 {
    1 << (day - 1)
}

fn parse_day(s: &str) -> Result<u8> {
    let s = s.trim();
    match s.parse::<u8>() {
        Ok(day) if (1..=7).contains(&day) => Ok(day),
        _ => Err(ImpulsesError::InvalidDayPattern(format!(
            "'{}' is not a day between 1 (Monday) and 7 (Sunday)",
            s
        ))),
    }
}

impl FromStr for DayPattern {
    type Err = ImpulsesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DayPattern {
    type Error = ImpulsesError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DayPattern> for String {
    fn from(pattern: DayPattern) -> Self {
        pattern.raw
    }
}

impl fmt::Display for DayPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

//
// ================= Local time helpers =================
//

/// Calendar date in the service timezone
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// (weekday, hour, minute) in the service timezone
pub fn local_slot(now: DateTime<Utc>, tz: Tz) -> (Weekday, u8, u8) {
    let local = now.with_timezone(&tz);
    (local.weekday(), local.hour() as u8, local.minute() as u8)
}

//
// ================= Due habits =================
//

/// A habit that is still ahead of us today, with its owner if known
#[derive(Debug, Clone)]
pub struct DueHabit {
    pub habit: Habit,
    pub user: Option<User>,
}

/// Habits scheduled for today whose time of day has not yet passed.
///
/// Times compare as (hour, minute) pairs. A habit whose user is missing
/// is still returned with `user: None`.
pub fn habits_due_today(
    habits: &[Habit],
    users: &HashMap<Uuid, User>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<DueHabit> {
    let (weekday, hour, minute) = local_slot(now, tz);

    habits
        .iter()
        .filter(|habit| habit.time_day_of_week.contains(weekday))
        .filter(|habit| (habit.time_hour, habit.time_minute) >= (hour, minute))
        .map(|habit| DueHabit {
            habit: habit.clone(),
            user: users.get(&habit.user_id).cloned(),
        })
        .collect()
}

/// Validate a habit's time of day
pub fn validate_time(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(ImpulsesError::InvalidInput(format!(
            "invalid time of day {:02}:{:02}",
            hour, minute
        )));
    }
    Ok(())
}
