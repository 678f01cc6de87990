//! Occupancy Schedule
//!
//! The weekly schedule and the store that owns, persists and updates it.

mod model;
mod store;

pub use model::*;
pub use store::*;

use chrono::NaiveTime;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid day: {0}")]
    InvalidDay(String),

    #[error("schedule has no entry for {0}")]
    MissingDay(Day),

    #[error("invalid time {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("start and end must both be set, or both be empty for a closed day")]
    PartialWindow,

    #[error("start {start} must be before end {end}")]
    EmptyWindow { start: NaiveTime, end: NaiveTime },

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write schedule: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize schedule: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read schedule: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schedule: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid schedule: {0}")]
    Invalid(#[from] ScheduleError),
}
