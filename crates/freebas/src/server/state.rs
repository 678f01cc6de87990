//! Server Application State
//!
//! Shared state accessible by all HTTP handlers.

use std::sync::Arc;
use std::time::Duration;

use bas_runtime::service::ServiceManager;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bacnet::BacnetClient;
use crate::config::AppConfig;
use crate::device::DeviceView;
use crate::occupancy::Clock;
use crate::schedule::ScheduleStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    schedule: Arc<ScheduleStore>,

    /// Read-only side of the device model
    device: DeviceView,

    bacnet: BacnetClient,

    service_manager: Arc<ServiceManager>,

    /// Same clock the sync loop evaluates the schedule with
    clock: Arc<dyn Clock>,

    config: AppConfig,

    sessions: DashMap<Uuid, Session>,
    session_ttl: Duration,
}

struct Session {
    username: String,
    expires_at: Instant,
}

impl AppState {
    pub fn new(
        schedule: Arc<ScheduleStore>,
        device: DeviceView,
        bacnet: BacnetClient,
        service_manager: Arc<ServiceManager>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
    ) -> Self {
        let session_ttl = Duration::from_secs(config.http.session_ttl_secs);
        Self {
            inner: Arc::new(AppStateInner {
                schedule,
                device,
                bacnet,
                service_manager,
                clock,
                config,
                sessions: DashMap::new(),
                session_ttl,
            }),
        }
    }

    pub fn schedule(&self) -> &ScheduleStore {
        &self.inner.schedule
    }

    pub fn device(&self) -> &DeviceView {
        &self.inner.device
    }

    pub fn bacnet(&self) -> &BacnetClient {
        &self.inner.bacnet
    }

    pub fn service_manager(&self) -> &ServiceManager {
        &self.inner.service_manager
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Check a username and password against the configured users
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.inner
            .config
            .users
            .iter()
            .any(|user| user.username == username && user.password == password)
    }

    pub fn create_session(&self, username: &str) -> Uuid {
        let now = Instant::now();
        self.inner.sessions.retain(|_, session| session.expires_at > now);

        let token = Uuid::new_v4();
        self.inner.sessions.insert(
            token,
            Session {
                username: username.to_string(),
                expires_at: now + self.inner.session_ttl,
            },
        );
        tracing::debug!("Session created for {}", username);
        token
    }

    /// Username behind a live session; each use extends it by the TTL
    pub fn session_user(&self, token: Uuid) -> Option<String> {
        let now = Instant::now();
        if let Some(mut session) = self.inner.sessions.get_mut(&token) {
            if session.expires_at > now {
                session.expires_at = now + self.inner.session_ttl;
                return Some(session.username.clone());
            }
        }
        if self
            .inner
            .sessions
            .remove_if(&token, |_, session| session.expires_at <= now)
            .is_some()
        {
            tracing::debug!("Session expired");
        }
        None
    }

    pub fn end_session(&self, token: Uuid) -> bool {
        self.inner.sessions.remove(&token).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}
