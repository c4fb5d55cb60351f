//! Reminder schedule calculation.
//!
//! Pure functions only: given a renewal date, the configured offsets and the
//! evaluation instant, produce the ordered reminder events a run walks through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Offsets used when none are configured, in days before renewal.
pub const DEFAULT_OFFSETS_DAYS: [u32; 4] = [7, 5, 2, 1];

/// Largest accepted offset, in days (about ten years).
pub const MAX_OFFSET_DAYS: u32 = 3650;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("at least one reminder offset is required")]
    Empty,

    #[error("reminder offsets must be positive, got {0}")]
    NonPositive(u32),

    #[error("reminder offset {0} exceeds the maximum of {MAX_OFFSET_DAYS} days")]
    TooLarge(u32),

    #[error("duplicate reminder offset: {0}")]
    Duplicate(u32),

    #[error("reminder {days_before} days before {renewal_date} is out of range")]
    OutOfRange {
        days_before: u32,
        renewal_date: DateTime<Utc>,
    },

    #[error("invalid reminder offset {value:?}: {reason}")]
    Invalid { value: String, reason: String },
}

/// Days-before-renewal at which reminders fire.
///
/// Always non-empty, between 1 and [`MAX_OFFSET_DAYS`], free of duplicates
/// and sorted descending, so reminders fire furthest-from-renewal first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct ReminderOffsets(Vec<u32>);

impl ReminderOffsets {
    pub fn new(days: impl IntoIterator<Item = u32>) -> Result<Self, ScheduleError> {
        let mut days: Vec<u32> = days.into_iter().collect();
        if days.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if days.contains(&0) {
            return Err(ScheduleError::NonPositive(0));
        }
        if let Some(&day) = days.iter().find(|&&day| day > MAX_OFFSET_DAYS) {
            return Err(ScheduleError::TooLarge(day));
        }

        days.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(pair) = days.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ScheduleError::Duplicate(pair[0]));
        }

        Ok(Self(days))
    }

    pub fn days(&self) -> &[u32] {
        &self.0
    }
}

impl Default for ReminderOffsets {
    fn default() -> Self {
        Self(DEFAULT_OFFSETS_DAYS.to_vec())
    }
}

impl TryFrom<Vec<u32>> for ReminderOffsets {
    type Error = ScheduleError;

    fn try_from(days: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(days)
    }
}

impl From<ReminderOffsets> for Vec<u32> {
    fn from(offsets: ReminderOffsets) -> Self {
        offsets.0
    }
}

/// Parses a comma-separated list such as `7,5,2,1`.
impl FromStr for ReminderOffsets {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let days = raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<u32>().map_err(|err| ScheduleError::Invalid {
                    value: item.to_string(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(days)
    }
}

impl fmt::Display for ReminderOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// What to do with a reminder whose instant had already passed when the
/// schedule was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedReminderPolicy {
    /// Send it right away, without sleeping.
    #[default]
    FireImmediately,
    /// Leave it out of the run.
    Skip,
}

impl MissedReminderPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FireImmediately => "fire",
            Self::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fire" | "fire_immediately" => Some(Self::FireImmediately),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// One reminder point in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderEvent {
    /// Durable label shared by the event's sleep point and dispatch step.
    pub label: String,
    pub days_before: u32,
    pub fires_at: DateTime<Utc>,
    /// `fires_at` was not after the evaluation instant.
    pub already_due: bool,
}

/// Label for the reminder `days_before` days ahead of renewal.
///
/// Depends on the offset alone so every replay regenerates the same labels.
pub fn reminder_label(days_before: u32) -> String {
    format!("Reminder {days_before} days before")
}

/// Compute the ordered reminder events for one renewal.
///
/// Events come back in offset order (furthest from renewal first), so
/// `fires_at` is strictly increasing. Events already due at `now` are kept
/// and flagged; the caller decides whether they still fire.
pub fn compute(
    renewal_date: DateTime<Utc>,
    offsets: &ReminderOffsets,
    now: DateTime<Utc>,
) -> Result<Vec<ReminderEvent>, ScheduleError> {
    offsets
        .days()
        .iter()
        .map(|&days_before| {
            let fires_at = renewal_date
                .checked_sub_signed(Duration::days(i64::from(days_before)))
                .ok_or(ScheduleError::OutOfRange {
                    days_before,
                    renewal_date,
                })?;
            Ok(ReminderEvent {
                label: reminder_label(days_before),
                days_before,
                fires_at,
                already_due: fires_at <= now,
            })
        })
        .collect()
}
