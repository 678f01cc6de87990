//! Service Lifecycle
//!
//! A service is a long-running component owned by the [`ServiceManager`].
//! Each one runs as its own task and is driven through these hooks:
//! - `on_start`: once, before anything else
//! - `on_tick`: every `tick_interval`, if one is set
//! - `on_event`: for each bus event matching a subscription
//! - `on_stop`: once, after a shutdown request
//!
//! A failing or panicking `on_tick`/`on_event` is logged and the service keeps
//! running. Only a shutdown ends the loop.

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during service lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Tick failed: {0}")]
    TickFailed(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Period of `on_tick`. The first tick fires one period after start.
    pub tick_interval: Option<Duration>,

    /// Event patterns this service subscribes to (e.g. "schedule/updated", "bacnet/*")
    pub subscriptions: Vec<String>,

    /// Upper bound for `on_stop`
    pub shutdown_timeout: Duration,

    pub description: Option<String>,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval: None,
            subscriptions: Vec::new(),
            shutdown_timeout: Duration::from_secs(10),
            description: None,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to every lifecycle hook
pub struct ServiceContext {
    pub service_id: String,
    event_publisher: EventPublisher,
}

impl ServiceContext {
    pub fn new(service_id: String, event_publisher: EventPublisher) -> Self {
        Self {
            service_id,
            event_publisher,
        }
    }

    /// Create and publish an event with this service as the source
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) {
        self.event_publisher
            .emit(event_type, &self.service_id, data);
    }

    /// Publisher that outlives the hook call, for background tasks
    pub fn publisher(&self) -> EventPublisher {
        self.event_publisher.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Service: Send + 'static {
    fn spec(&self) -> ServiceSpec;

    /// Acquire resources. An error here marks the service failed and it never runs.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Release resources. Called once; the service is stopped even if this fails.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}
