//! Weekly schedule types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::ScheduleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Day {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Day {
    /// Week order used for display and persistence
    pub const ALL: [Day; 7] = [
        Day::Sunday,
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Day::Sunday => "Sunday",
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
            Day::Saturday => "Saturday",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Day {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Day::ALL
            .into_iter()
            .find(|day| day.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ScheduleError::InvalidDay(s.to_string()))
    }
}

impl From<Weekday> for Day {
    fn from(weekday: Weekday) -> Self {
        Day::ALL[weekday.num_days_from_sunday() as usize]
    }
}

impl Serialize for Day {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Day Window
// ─────────────────────────────────────────────────────────────────────────────

const TIME_FORMAT: &str = "%H:%M";

fn parse_time(s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ScheduleError::InvalidTime(s.to_string()))
}

/// Empty strings count as unset, which is how the schedule form sends "closed"
fn parse_optional_time(s: Option<&str>) -> Result<Option<NaiveTime>, ScheduleError> {
    match s.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_time(s).map(Some),
    }
}

/// Occupied hours of one day, `[start, end)`
///
/// Both unset means closed all day. A window with only one side set, or with
/// `start >= end`, never matches; [`DayWindow::parse`] refuses to build one
/// but a hand-edited schedule file may still contain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayWindow {
    #[serde(with = "hhmm")]
    pub start: Option<NaiveTime>,
    #[serde(with = "hhmm")]
    pub end: Option<NaiveTime>,
}

impl DayWindow {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(start: NaiveTime, end: NaiveTime) -> Result<Self, ScheduleError> {
        if start >= end {
            return Err(ScheduleError::EmptyWindow { start, end });
        }
        Ok(Self {
            start: Some(start),
            end: Some(end),
        })
    }

    /// Validate user input into a window
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, ScheduleError> {
        match (parse_optional_time(start)?, parse_optional_time(end)?) {
            (None, None) => Ok(Self::closed()),
            (Some(start), Some(end)) => Self::open(start, end),
            _ => Err(ScheduleError::PartialWindow),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= time && time < end,
            _ => false,
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => serializer.collect_str(&t.format(super::TIME_FORMAT)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        super::parse_optional_time(raw.as_deref()).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Weekly Schedule
// ─────────────────────────────────────────────────────────────────────────────

/// A window for each of the seven days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: [DayWindow; 7],
}

impl Default for WeeklySchedule {
    /// Weekdays 07:00 to 17:00, weekends closed
    fn default() -> Self {
        let office_hours = DayWindow {
            start: NaiveTime::from_hms_opt(7, 0, 0),
            end: NaiveTime::from_hms_opt(17, 0, 0),
        };
        let mut days = [office_hours; 7];
        days[Day::Sunday.index()] = DayWindow::closed();
        days[Day::Saturday.index()] = DayWindow::closed();
        Self { days }
    }
}

impl WeeklySchedule {
    pub fn closed() -> Self {
        Self {
            days: [DayWindow::closed(); 7],
        }
    }

    pub fn window(&self, day: Day) -> DayWindow {
        self.days[day.index()]
    }

    pub fn with_day(mut self, day: Day, window: DayWindow) -> Self {
        self.days[day.index()] = window;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Day, DayWindow)> + '_ {
        Day::ALL.into_iter().map(|day| (day, self.window(day)))
    }
}

impl Serialize for WeeklySchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(7))?;
        for (day, window) in self.iter() {
            map.serialize_entry(day.name(), &window)?;
        }
        map.end()
    }
}

impl TryFrom<BTreeMap<String, DayWindow>> for WeeklySchedule {
    type Error = ScheduleError;

    /// Every day must be present; unknown keys are rejected
    fn try_from(entries: BTreeMap<String, DayWindow>) -> Result<Self, Self::Error> {
        let mut days: [Option<DayWindow>; 7] = [None; 7];
        for (name, window) in entries {
            let day: Day = name.parse()?;
            days[day.index()] = Some(window);
        }

        let mut schedule = WeeklySchedule::closed();
        for day in Day::ALL {
            let window = days[day.index()].ok_or(ScheduleError::MissingDay(day))?;
            schedule = schedule.with_day(day, window);
        }
        Ok(schedule)
    }
}
