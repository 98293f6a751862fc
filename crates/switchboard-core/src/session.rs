//! Session handle owned by the hub.
//!
//! A [`Session`] is the hub's half of one live connection: its identity and
//! the sending side of its bounded outbound queue. The receiving side is
//! handed to whatever task writes to the physical connection.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default outbound queue capacity per session.
pub const DEFAULT_SESSION_BUFFER: usize = 256;

/// A session identifier.
pub type SessionId = String;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique session ID.
#[must_use]
pub fn generate_session_id() -> SessionId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess_{:x}_{:x}", timestamp, counter)
}

/// Outcome of a non-blocking push into an outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was queued.
    Queued,
    /// The queue was full and the frame was dropped.
    Full,
    /// The receiving side is gone.
    Closed,
}

/// The hub-owned half of a connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    principal: Option<String>,
    outbound: mpsc::Sender<Bytes>,
}

impl Session {
    /// Create a session with a generated ID.
    ///
    /// Returns the session and the receiving end of its outbound queue.
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(principal: Option<String>, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_id(generate_session_id(), principal, capacity)
    }

    /// Create a session with a caller-chosen ID.
    #[must_use]
    pub fn with_id(
        id: impl Into<SessionId>,
        principal: Option<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: id.into(),
            principal: principal.filter(|p| !p.is_empty()),
            outbound,
        };
        (session, rx)
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the authenticated principal, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Push a frame without waiting.
    pub fn try_deliver(&self, frame: Bytes) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
        assert!(id1.starts_with("sess_"));
    }

    #[test]
    fn test_empty_principal_is_anonymous() {
        let (session, _rx) = Session::new(Some(String::new()), 4);
        assert!(session.principal().is_none());

        let (session, _rx) = Session::new(Some("user-1".into()), 4);
        assert_eq!(session.principal(), Some("user-1"));
    }

    #[test]
    fn test_try_deliver_drops_when_full() {
        let (session, mut rx) = Session::with_id("sess-1", None, 1);

        assert_eq!(session.try_deliver(Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(session.try_deliver(Bytes::from_static(b"b")), Delivery::Full);

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        drop(rx);
        assert_eq!(session.try_deliver(Bytes::from_static(b"c")), Delivery::Closed);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let (session, _rx) = Session::new(None, 0);
        assert_eq!(session.try_deliver(Bytes::from_static(b"a")), Delivery::Queued);
    }
}
