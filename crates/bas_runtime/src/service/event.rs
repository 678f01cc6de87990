//! Service Events
//!
//! A broadcast bus shared by all services of one manager.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Slash separated type, e.g. "schedule/updated"
    pub event_type: String,

    /// Publishing service or subsystem
    pub source: String,

    pub data: serde_json::Value,

    /// Unix milliseconds
    pub timestamp: u64,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Check if this event matches a subscription pattern
    ///
    /// `"*"` matches everything, `"bacnet/*"` matches any type below
    /// `bacnet/`, anything else must match exactly.
    pub fn matches(&self, pattern: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some("") => true,
            Some(prefix) if prefix.ends_with('/') => self.event_type.starts_with(prefix),
            _ => self.event_type == pattern,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// Cloneable publishing side of the bus
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Publish an event. Having no subscriber is not an error.
    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event dropped, no subscribers");
        }
    }

    pub fn emit(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.publish(Event::new(event_type, source, data));
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}
