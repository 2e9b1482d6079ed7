pub mod astronomy;

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::ScheduleSection;

pub use astronomy::{AstronomyError, AstronomySource, HttpPageFetcher, PageFetcher};

pub const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unrecognised time of day: {0:?}")]
    InvalidTime(String),
    #[error("empty schedule window: activation {activation} is not before deactivation {deactivation}")]
    EmptyWindow {
        activation: String,
        deactivation: String,
    },
}

/// Parses a wall-clock string into seconds since midnight. Accepts 24-hour
/// (`18:42`, `06:05:30`) and 12-hour (`6:05 am`, `6:42:10 P.M.`) forms.
pub fn time_to_seconds(value: &str) -> Result<u32, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(value.to_string());
    let normalized: String = value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| *c != '.')
        .collect();
    let (clock, meridiem) = if let Some(rest) = normalized.strip_suffix("am") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = normalized.strip_suffix("pm") {
        (rest.trim_end(), Some(true))
    } else {
        (normalized.as_str(), None)
    };

    let mut parts = clock.split(':');
    let mut next = |required: bool| -> Result<Option<u32>, ScheduleError> {
        match parts.next() {
            Some(part) if !part.is_empty() && part.len() <= 2 => {
                part.parse::<u32>().map(Some).map_err(|_| invalid())
            }
            Some(_) => Err(invalid()),
            None if required => Err(invalid()),
            None => Ok(None),
        }
    };
    let hour = next(true)?.ok_or_else(invalid)?;
    let minute = next(true)?.ok_or_else(invalid)?;
    let second = next(false)?.unwrap_or(0);
    if parts.next().is_some() || minute > 59 || second > 59 {
        return Err(invalid());
    }

    let hour = match meridiem {
        None if hour <= 23 => hour,
        Some(pm) if (1..=12).contains(&hour) => match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, false) => h,
            (h, true) => h + 12,
        },
        _ => return Err(invalid()),
    };
    Ok(hour * 3600 + minute * 60 + second)
}

/// Formats seconds since midnight as `HH:MM:SS`.
pub fn format_seconds(seconds: u32) -> String {
    let seconds = seconds.min(SECONDS_PER_DAY);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub fn seconds_since_midnight(time: NaiveTime) -> u32 {
    time.num_seconds_from_midnight()
}

/// Sunrise and sunset for one day, in seconds since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AstronomicalTimes {
    pub sunrise: u32,
    pub sunset: u32,
}

impl AstronomicalTimes {
    pub fn parse(sunrise: &str, sunset: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            sunrise: time_to_seconds(sunrise)?,
            sunset: time_to_seconds(sunset)?,
        })
    }
}

/// The day's on-air window and segment limits. Fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub date: NaiveDate,
    pub activation: u32,
    pub deactivation: u32,
    pub max_segment: Duration,
    pub grace: Duration,
    pub midday_split: bool,
}

impl ScheduleWindow {
    pub fn length(&self) -> Duration {
        Duration::from_secs(u64::from(self.deactivation - self.activation))
    }

    pub fn midpoint(&self) -> u32 {
        self.activation + (self.deactivation - self.activation) / 2
    }

    fn at(&self, seconds: u32, offset: &FixedOffset) -> DateTime<Utc> {
        let midnight = NaiveDateTime::new(self.date, NaiveTime::default());
        let local = midnight + chrono::Duration::seconds(i64::from(seconds));
        let utc = local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    pub fn deactivation_at(&self, offset: &FixedOffset) -> DateTime<Utc> {
        self.at(self.deactivation, offset)
    }

    pub fn midpoint_at(&self, offset: &FixedOffset) -> DateTime<Utc> {
        self.at(self.midpoint(), offset)
    }
}

/// True iff `activation <= now < deactivation`.
pub fn should_be_on(now: u32, window: &ScheduleWindow) -> bool {
    window.activation <= now && now < window.deactivation
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitReason {
    MaxLength,
    Midday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentDecision {
    Continue,
    /// Over the limit, but the segment would overshoot it by less than the
    /// grace period, so it runs to the end of the day.
    Extend,
    Split(SplitReason),
}

fn to_std(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// Rolling maximum-length check. A segment older than `max_segment` is split
/// unless the whole segment, measured from its start to deactivation,
/// overshoots `max_segment` by less than `grace`. The answer does not depend
/// on how late the check runs.
pub fn exceeds_max_segment(
    started_at: DateTime<Utc>,
    now: DateTime<FixedOffset>,
    window: &ScheduleWindow,
) -> bool {
    let elapsed = to_std(now.with_timezone(&Utc) - started_at);
    if elapsed <= window.max_segment {
        return false;
    }
    let full_length = to_std(window.deactivation_at(now.offset()) - started_at);
    full_length.saturating_sub(window.max_segment) >= window.grace
}

/// Midday policy: one forced split at the window's midpoint when the whole
/// window would not fit in a single segment.
pub fn midday_split_due(
    started_at: DateTime<Utc>,
    now: DateTime<FixedOffset>,
    window: &ScheduleWindow,
) -> bool {
    if !window.midday_split || window.length() <= window.max_segment {
        return false;
    }
    let midpoint = window.midpoint_at(now.offset());
    started_at < midpoint && now.with_timezone(&Utc) >= midpoint
}

pub fn segment_decision(
    started_at: DateTime<Utc>,
    now: DateTime<FixedOffset>,
    window: &ScheduleWindow,
) -> SegmentDecision {
    if midday_split_due(started_at, now, window) {
        return SegmentDecision::Split(SplitReason::Midday);
    }
    if exceeds_max_segment(started_at, now, window) {
        return SegmentDecision::Split(SplitReason::MaxLength);
    }
    let elapsed = to_std(now.with_timezone(&Utc) - started_at);
    if elapsed > window.max_segment {
        SegmentDecision::Extend
    } else {
        SegmentDecision::Continue
    }
}

/// Turns astronomical times and configured offsets into the day's window.
#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    config: ScheduleSection,
}

impl ScheduleEvaluator {
    pub fn new(config: ScheduleSection) -> Self {
        Self { config }
    }

    pub fn compute_window(
        &self,
        today: NaiveDate,
        times: &AstronomicalTimes,
    ) -> Result<ScheduleWindow, ScheduleError> {
        let shift = |base: u32, minutes: i64| -> u32 {
            let shifted = i64::from(base) + minutes * 60;
            shifted.clamp(0, i64::from(SECONDS_PER_DAY)) as u32
        };
        let activation = shift(times.sunrise, self.config.start_offset_minutes);
        let deactivation = shift(times.sunset, self.config.stop_offset_minutes);
        if activation >= deactivation {
            return Err(ScheduleError::EmptyWindow {
                activation: format_seconds(activation),
                deactivation: format_seconds(deactivation),
            });
        }
        let window = ScheduleWindow {
            date: today,
            activation,
            deactivation,
            max_segment: Duration::from_secs(self.config.max_segment_minutes * 60),
            grace: Duration::from_secs(self.config.grace_minutes * 60),
            midday_split: self.config.midday_split,
        };
        info!(
            %today,
            activation = %format_seconds(activation),
            deactivation = %format_seconds(deactivation),
            "schedule window computed"
        );
        Ok(window)
    }

    pub fn should_be_on(&self, now: DateTime<FixedOffset>, window: &ScheduleWindow) -> bool {
        should_be_on(seconds_since_midnight(now.time()), window)
    }
}
