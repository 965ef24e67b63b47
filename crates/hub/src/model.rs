//! Domain records: zones, recurring schedules and watering events.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::{OffsetDateTime, Weekday};

use crate::error::{Error, Result};

pub type ZoneId = u32;
pub type ScheduleId = u32;
pub type EventId = u64;

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub active: bool,
    /// Soil moisture percentage, 0..=100.
    pub moisture: u8,
}

// ---------------------------------------------------------------------------
// Days and fire times
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Day {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<Weekday> for Day {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Monday => Self::Mon,
            Weekday::Tuesday => Self::Tue,
            Weekday::Wednesday => Self::Wed,
            Weekday::Thursday => Self::Thu,
            Weekday::Friday => Self::Fri,
            Weekday::Saturday => Self::Sat,
            Weekday::Sunday => Self::Sun,
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Day {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Mon" => Ok(Self::Mon),
            "Tue" => Ok(Self::Tue),
            "Wed" => Ok(Self::Wed),
            "Thu" => Ok(Self::Thu),
            "Fri" => Ok(Self::Fri),
            "Sat" => Ok(Self::Sat),
            "Sun" => Ok(Self::Sun),
            other => Err(Error::invalid_input(format!("unknown day '{other}'"))),
        }
    }
}

/// Wall-clock minute at which a schedule fires, normalised to 24-hour form.
///
/// Accepts `h:MM AM`/`h:MM PM` (hour 1..=12, `12 AM` is midnight and `12 PM`
/// is noon) or a bare 24-hour `H:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FireTime {
    hour: u8,
    minute: u8,
}

impl FireTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn parse(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let (clock, pm) = if let Some(rest) = upper.strip_suffix("AM") {
            (rest.trim_end(), Some(false))
        } else if let Some(rest) = upper.strip_suffix("PM") {
            (rest.trim_end(), Some(true))
        } else {
            (upper.as_str(), None)
        };

        let (h, m) = clock
            .split_once(':')
            .ok_or_else(|| Error::invalid_time(s, "expected H:MM"))?;
        let hour: u8 = h
            .trim()
            .parse()
            .map_err(|_| Error::invalid_time(s, "hour is not a number"))?;
        if m.len() != 2 {
            return Err(Error::invalid_time(s, "minute must have two digits"));
        }
        let minute: u8 = m
            .parse()
            .map_err(|_| Error::invalid_time(s, "minute is not a number"))?;
        if minute > 59 {
            return Err(Error::invalid_time(s, "minute out of range 0-59"));
        }

        let hour = match pm {
            Some(pm) => {
                if !(1..=12).contains(&hour) {
                    return Err(Error::invalid_time(s, "hour out of range 1-12"));
                }
                match (hour, pm) {
                    (12, false) => 0,
                    (12, true) => 12,
                    (h, false) => h,
                    (h, true) => h + 12,
                }
            }
            None => {
                if hour > 23 {
                    return Err(Error::invalid_time(s, "hour out of range 0-23"));
                }
                hour
            }
        };

        Ok(Self { hour, minute })
    }
}

impl fmt::Display for FireTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h12 = match self.hour {
            0 => 12,
            h if h > 12 => h - 12,
            h => h,
        };
        let suffix = if self.hour < 12 { "AM" } else { "PM" };
        write!(f, "{h12}:{:02} {suffix}", self.minute)
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    /// Fire time as entered, e.g. "5:30 AM".
    pub time: String,
    pub days: Vec<Day>,
    /// Target zones, activated in this order.
    pub zones: Vec<ZoneId>,
    pub duration_min: u32,
    pub active: bool,
}

impl Schedule {
    pub fn fire_time(&self) -> Result<FireTime> {
        FireTime::parse(&self.time)
    }

    pub fn duration(&self) -> Duration {
        minutes(self.duration_min)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub time: String,
    pub days: Vec<Day>,
    pub zones: Vec<ZoneId>,
    pub duration_min: u32,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl NewSchedule {
    /// Checks the shape of the schedule. Whether the target zones exist is
    /// left to the caller, which knows the zone set.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_input("schedule name is empty"));
        }
        FireTime::parse(&self.time)?;
        if self.days.is_empty() {
            return Err(Error::invalid_input("schedule has no days"));
        }
        if self.zones.is_empty() {
            return Err(Error::invalid_input("schedule has no zones"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.zones.iter().find(|z| !seen.insert(**z)) {
            return Err(Error::invalid_input(format!(
                "zone {dup} listed twice in schedule"
            )));
        }
        if self.duration_min == 0 {
            return Err(Error::invalid_input("duration_min must be positive"));
        }
        Ok(())
    }

    pub fn into_schedule(self, id: ScheduleId) -> Schedule {
        Schedule {
            id,
            name: self.name,
            time: self.time,
            days: self.days,
            zones: self.zones,
            duration_min: self.duration_min,
            active: self.active,
        }
    }
}

// ---------------------------------------------------------------------------
// Watering events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled { schedule_id: ScheduleId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WateringEvent {
    pub id: EventId,
    pub zone_id: ZoneId,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    /// Absent while the zone is still watering.
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    pub trigger: Trigger,
}

impl WateringEvent {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.trigger, Trigger::Manual)
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.trigger, Trigger::Scheduled { .. })
    }

    pub fn schedule_id(&self) -> Option<ScheduleId> {
        match self.trigger {
            Trigger::Scheduled { schedule_id } => Some(schedule_id),
            Trigger::Manual => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewWateringEvent {
    pub zone_id: ZoneId,
    pub start: OffsetDateTime,
    pub trigger: Trigger,
}

/// One moisture sample, recorded whenever a zone's moisture changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoistureReading {
    pub zone_id: ZoneId,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub moisture: u8,
}

pub fn minutes(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 60)
}

// ===========================================================================
// Tests
// ===========================================================================
