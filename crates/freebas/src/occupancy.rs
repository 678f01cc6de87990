//! Occupancy Evaluation
//!
//! [`evaluate`] is a pure function of a schedule snapshot and a wall-clock
//! time. The [`Clock`] supplies "now" in the zone the schedule is written in.

use chrono::{Datelike, Local, NaiveDateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;

use crate::schedule::{Day, WeeklySchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OccupancyResult {
    pub is_occupied: bool,
}

/// Decide whether the building is occupied at `now`
///
/// Windows are half-open, `[start, end)`, and never wrap past midnight.
pub fn evaluate(schedule: &WeeklySchedule, now: NaiveDateTime) -> OccupancyResult {
    let window = schedule.window(Day::from(now.weekday()));
    OccupancyResult {
        is_occupied: window.contains(now.time()),
    }
}

/// Source of the current local wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall clock in a fixed IANA zone, or the host's local zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    tz: Option<Tz>,
}

impl SystemClock {
    pub fn new(tz: Option<Tz>) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.tz {
            Some(tz) => Utc::now().with_timezone(&tz).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
