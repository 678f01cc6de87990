//! Schedule Store
//!
//! Single owner of the live schedule. Readers take cheap snapshots; updates
//! are serialized, persisted first and only then made visible.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bas_runtime::service::EventPublisher;
use parking_lot::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Day, DayWindow, LoadError, PersistError, ScheduleError, WeeklySchedule};

/// Event published after every successful update
pub const SCHEDULE_UPDATED: &str = "schedule/updated";

/// Where the schedule in effect came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOrigin {
    File,
    Defaults,
}

pub struct ScheduleStore {
    path: PathBuf,
    current: RwLock<WeeklySchedule>,
    write_lock: Mutex<()>,
    origin: ScheduleOrigin,
    events: Option<EventPublisher>,
}

impl ScheduleStore {
    /// Open the store at `path`
    ///
    /// A missing or unreadable file is not fatal: the built-in default
    /// schedule is used and the file is written on the first update.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (schedule, origin) = match Self::load(&path).await {
            Ok(schedule) => {
                info!("Loaded schedule from {}", path.display());
                (schedule, ScheduleOrigin::File)
            }
            Err(LoadError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                info!("No schedule at {}, using defaults", path.display());
                (WeeklySchedule::default(), ScheduleOrigin::Defaults)
            }
            Err(e) => {
                warn!("Could not load schedule from {}: {}; using defaults", path.display(), e);
                (WeeklySchedule::default(), ScheduleOrigin::Defaults)
            }
        };

        Self {
            path,
            current: RwLock::new(schedule),
            write_lock: Mutex::new(()),
            origin,
            events: None,
        }
    }

    /// Publish [`SCHEDULE_UPDATED`] on this bus after each update
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Read and validate a persisted schedule
    pub async fn load(path: &Path) -> Result<WeeklySchedule, LoadError> {
        let content = fs::read_to_string(path).await?;
        let entries: BTreeMap<String, DayWindow> = serde_json::from_str(&content)?;
        Ok(WeeklySchedule::try_from(entries)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> ScheduleOrigin {
        self.origin
    }

    pub fn snapshot(&self) -> WeeklySchedule {
        *self.current.read()
    }

    /// Persist `schedule` and make it the live schedule
    pub async fn save(&self, schedule: &WeeklySchedule) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().await;
        self.write_file(schedule).await?;
        *self.current.write() = *schedule;
        Ok(())
    }

    /// Replace one day's window
    ///
    /// On any error the live schedule and the file are left as they were.
    pub async fn update_day(&self, day: &str, window: DayWindow) -> Result<WeeklySchedule, ScheduleError> {
        let day: Day = day.parse()?;

        let _guard = self.write_lock.lock().await;
        let updated = self.snapshot().with_day(day, window);
        self.write_file(&updated).await?;
        *self.current.write() = updated;

        info!(%day, start = ?window.start, end = ?window.end, "Schedule updated");
        if let Some(events) = &self.events {
            events.emit(
                SCHEDULE_UPDATED,
                "schedule-store",
                serde_json::json!({ "day": day.name() }),
            );
        }
        Ok(updated)
    }

    /// Write to a sibling temp file and rename over the target, so readers
    /// of the file never see a partial schedule
    async fn write_file(&self, schedule: &WeeklySchedule) -> Result<(), PersistError> {
        let mut content = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut content, formatter);
        serde::Serialize::serialize(schedule, &mut serializer)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &content).await?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Schedule written to {}", self.path.display());
        Ok(())
    }
}

impl std::fmt::Debug for ScheduleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleStore")
            .field("path", &self.path)
            .field("origin", &self.origin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ScheduleStore::open(dir.path().join("schedule.json")).await;

        assert_eq!(store.origin(), ScheduleOrigin::Defaults);
        assert_eq!(store.snapshot(), WeeklySchedule::default());
    }

    #[tokio::test]
    async fn test_corrupt_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");
        fs::write(&path, r#"{"Monday": {"start": "07:00", "end": "17:00"}}"#)
            .await
            .unwrap();

        assert!(matches!(
            ScheduleStore::load(&path).await,
            Err(LoadError::Invalid(ScheduleError::MissingDay(_)))
        ));

        let store = ScheduleStore::open(&path).await;
        assert_eq!(store.origin(), ScheduleOrigin::Defaults);
    }

    #[tokio::test]
    async fn test_save_load_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("schedule.json");
        let store = ScheduleStore::open(&path).await;

        store.save(&WeeklySchedule::default()).await.unwrap();
        let first = fs::read(&path).await.unwrap();

        let loaded = ScheduleStore::load(&path).await.unwrap();
        assert_eq!(loaded, WeeklySchedule::default());
        store.save(&loaded).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), first);

        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("    \"Sunday\": {\n        \"start\": null,"));
        assert!(!dir.path().join("nested").join("schedule.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_update_day_persists_and_publishes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");
        let (tx, mut rx) = broadcast::channel(4);
        let store = ScheduleStore::open(&path)
            .await
            .with_events(EventPublisher::new(tx));

        let window = DayWindow::open(t(9, 0), t(13, 0)).unwrap();
        let updated = store.update_day("saturday", window).await.unwrap();

        assert_eq!(updated.window(Day::Saturday), window);
        assert_eq!(store.snapshot(), updated);
        assert_eq!(ScheduleStore::load(&path).await.unwrap(), updated);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, SCHEDULE_UPDATED);
        assert_eq!(event.get_str("day"), Some("Saturday"));
    }

    #[tokio::test]
    async fn test_invalid_day_leaves_schedule_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedule.json");
        let store = ScheduleStore::open(&path).await;

        let result = store.update_day("Funday", DayWindow::closed()).await;

        assert!(matches!(result, Err(ScheduleError::InvalidDay(_))));
        assert_eq!(store.snapshot(), WeeklySchedule::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_schedule_unchanged() {
        let dir = TempDir::new().unwrap();
        // The target is a directory, so the final rename fails
        let path = dir.path().join("schedule.json");
        std::fs::create_dir(&path).unwrap();
        let store = ScheduleStore::open(&path).await;

        let result = store.update_day("Monday", DayWindow::closed()).await;

        assert!(matches!(result, Err(ScheduleError::Persist(_))));
        assert_eq!(store.snapshot().window(Day::Monday), WeeklySchedule::default().window(Day::Monday));
    }
}
