//! Events carried through the publish/subscribe bus.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique event identifier.
pub type EventId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate an event ID unique within this process.
#[must_use]
pub fn generate_event_id() -> EventId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An immutable unit of data published on a topic.
///
/// Cloning is cheap: the payload is reference counted, so one publish can
/// hand the same event to many subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    topic: String,
    payload: Bytes,
    timestamp: u64,
}

impl Event {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_event_id(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Derive an event with a replaced payload, keeping id, topic and timestamp.
    #[must_use]
    pub fn with_payload(self, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..self
        }
    }

    /// Derive an event with a replaced topic.
    #[must_use]
    pub fn with_topic(self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self
        }
    }

    /// Get the event ID.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Get the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Milliseconds since the Unix epoch at creation.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}
