//! Connection hub for Switchboard.
//!
//! The hub is the single source of truth for which sessions are connected and
//! which rooms they are in. Every mutation and every broadcast is sent as a
//! command to one control loop, so membership changes are totally ordered
//! with respect to deliveries. Point-in-time queries such as
//! [`Hub::connected_count`] skip the loop and read the shared maps under a
//! reader/writer lock that only the loop ever takes for writing.
//!
//! ```text
//!  register / join / broadcast ──▶ command queue ──▶ control loop ──▶ session queues
//!                                                       │ (write)
//!  connected_count / room_size ◀──── RwLock<HubState> ◀─┘
//! ```

use crate::room::{validate_room_name, RoomId, Rooms};
use crate::session::{Delivery, Session, SessionId};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::{codec, Envelope, ProtocolError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The control loop has stopped.
    #[error("Hub is shut down")]
    Closed,

    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the control loop's command queue.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
        }
    }
}

/// Recipients of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every registered session.
    All,
    /// Members of one room.
    Room(RoomId),
    /// Every session authenticated as this principal.
    User(String),
    /// A single session.
    Session(SessionId),
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of registered sessions.
    pub connected: usize,
    /// Number of non-empty rooms.
    pub rooms: usize,
    /// Frames queued to sessions since start.
    pub delivered: u64,
    /// Frames dropped because a session queue was full or closed.
    pub dropped: u64,
}

enum Command {
    Register(Session),
    Unregister(SessionId),
    Join { session: SessionId, room: RoomId },
    Leave { session: SessionId, room: RoomId },
    Deliver { target: Target, frame: Bytes },
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct SessionEntry {
    session: Session,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: Rooms,
}

struct Shared {
    state: RwLock<HubState>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the connection hub.
///
/// Cloning the handle is cheap; all clones talk to the same control loop.
/// The loop stops on [`Hub::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl Hub {
    /// Start a hub with the given configuration.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let shared = Arc::new(Shared {
            state: RwLock::new(HubState::default()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let control = ControlLoop {
            commands: rx,
            shared: Arc::clone(&shared),
        };
        tokio::spawn(control.run());

        info!("Hub started with config: {:?}", config);
        Self { commands, shared }
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Add a session to the live set.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn register(&self, session: Session) -> Result<(), HubError> {
        self.send(Command::Register(session)).await
    }

    /// Remove a session from the live set and from every room.
    ///
    /// Dropping the hub's entry closes the session's outbound queue. Calling
    /// this for a session that is not registered is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn unregister(&self, session: &str) -> Result<(), HubError> {
        self.send(Command::Unregister(session.to_string())).await
    }

    /// Add a session to a room, creating the room if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or the hub has shut down.
    pub async fn join_room(&self, session: &str, room: &str) -> Result<(), HubError> {
        validate_room_name(room).map_err(HubError::InvalidRoom)?;
        self.send(Command::Join {
            session: session.to_string(),
            room: room.to_string(),
        })
        .await
    }

    /// Remove a session from a room, deleting the room if it becomes empty.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn leave_room(&self, session: &str, room: &str) -> Result<(), HubError> {
        self.send(Command::Leave {
            session: session.to_string(),
            room: room.to_string(),
        })
        .await
    }

    /// Queue a pre-encoded frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn deliver(&self, target: Target, frame: Bytes) -> Result<(), HubError> {
        self.send(Command::Deliver { target, frame }).await
    }

    /// Encode an envelope and queue it for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the hub has shut down.
    pub async fn dispatch(&self, target: Target, envelope: &Envelope) -> Result<(), HubError> {
        let frame = codec::encode(envelope)?;
        self.deliver(target, frame).await
    }

    /// Send an envelope to a single session.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the hub has shut down.
    pub async fn send_to(&self, session: &str, envelope: &Envelope) -> Result<(), HubError> {
        self.dispatch(Target::Session(session.to_string()), envelope)
            .await
    }

    /// Broadcast a message to every connected session.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the hub has shut down.
    pub async fn broadcast_to_all<T>(&self, kind: &str, payload: &T) -> Result<(), HubError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::new(kind).with_payload_of(payload)?;
        self.dispatch(Target::All, &envelope).await
    }

    /// Broadcast a message to the members of a room.
    ///
    /// A room that does not exist has no members; nothing is delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the hub has shut down.
    pub async fn broadcast_to_room<T>(
        &self,
        room: &str,
        kind: &str,
        payload: &T,
    ) -> Result<(), HubError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::new(kind)
            .with_room(room)
            .with_payload_of(payload)?;
        self.dispatch(Target::Room(room.to_string()), &envelope)
            .await
    }

    /// Broadcast a message to every session of one principal.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the hub has shut down.
    pub async fn broadcast_to_user<T>(
        &self,
        principal: &str,
        kind: &str,
        payload: &T,
    ) -> Result<(), HubError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let envelope = Envelope::new(kind).with_payload_of(payload)?;
        self.dispatch(Target::User(principal.to_string()), &envelope)
            .await
    }

    /// Wait until every command issued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has shut down.
    pub async fn sync(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sync(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Close every session queue and stop the control loop.
    ///
    /// Commands already queued ahead of the shutdown are applied first.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub was already shut down.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Check if the control loop is still accepting commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Get the number of registered sessions.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.shared.state.read().sessions.len()
    }

    /// Get the number of sessions in a room.
    #[must_use]
    pub fn room_size(&self, room: &str) -> usize {
        self.shared.state.read().rooms.size(room)
    }

    /// Get all room names.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.shared.state.read().rooms.names()
    }

    /// Get the rooms a session is in.
    #[must_use]
    pub fn session_rooms(&self, session: &str) -> Vec<RoomId> {
        self.shared
            .state
            .read()
            .sessions
            .get(session)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn is_connected(&self, session: &str) -> bool {
        self.shared.state.read().sessions.contains_key(session)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.shared.state.read();
        HubStats {
            connected: state.sessions.len(),
            rooms: state.rooms.len(),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

/// The single mutator of hub state.
struct ControlLoop {
    commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
}

impl ControlLoop {
    async fn run(mut self) {
        debug!("Hub control loop running");

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(session) => self.register(session),
                Command::Unregister(id) => self.unregister(&id),
                Command::Join { session, room } => self.join(&session, room),
                Command::Leave { session, room } => self.leave(&session, &room),
                Command::Deliver { target, frame } => {
                    let count = self.deliver(&target, &frame);
                    trace!(to = ?target, recipients = count, "Delivered frame");
                }
                Command::Sync(ack) => {
                    let _ = ack.send(());
                }
                Command::Shutdown(ack) => {
                    self.close_all();
                    self.commands.close();
                    let _ = ack.send(());
                    break;
                }
            }
        }

        self.close_all();
        info!("Hub stopped");
    }

    fn register(&self, session: Session) {
        let id = session.id().to_string();
        let mut state = self.shared.state.write();

        if let Some(previous) = state.sessions.remove(&id) {
            warn!(session = %id, "Session ID registered twice, replacing");
            for room in &previous.rooms {
                state.rooms.leave(room, &id);
            }
        }

        info!(
            session = %id,
            principal = session.principal().unwrap_or(""),
            "Session registered"
        );
        state.sessions.insert(
            id,
            SessionEntry {
                session,
                rooms: HashSet::new(),
            },
        );
    }

    fn unregister(&self, id: &str) {
        let mut state = self.shared.state.write();

        let Some(entry) = state.sessions.remove(id) else {
            return;
        };
        for room in &entry.rooms {
            state.rooms.leave(room, id);
        }

        info!(
            session = %id,
            principal = entry.session.principal().unwrap_or(""),
            rooms = entry.rooms.len(),
            "Session unregistered"
        );
        // Dropping the entry drops the last sender of the outbound queue.
    }

    fn join(&self, id: &str, room: RoomId) {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;

        let Some(entry) = state.sessions.get_mut(id) else {
            debug!(session = %id, room = %room, "Join for unknown session ignored");
            return;
        };
        state.rooms.join(&room, id);
        debug!(session = %id, room = %room, members = state.rooms.size(&room), "Joined room");
        entry.rooms.insert(room);
    }

    fn leave(&self, id: &str, room: &str) {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;

        let Some(entry) = state.sessions.get_mut(id) else {
            return;
        };
        if entry.rooms.remove(room) {
            state.rooms.leave(room, id);
            debug!(session = %id, room = %room, "Left room");
        }
    }

    fn deliver(&self, target: &Target, frame: &Bytes) -> usize {
        let state = self.shared.state.read();

        match target {
            Target::All => state
                .sessions
                .values()
                .filter(|entry| self.push(entry, frame))
                .count(),
            Target::Room(room) => state
                .rooms
                .members(room)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| state.sessions.get(id))
                        .filter(|entry| self.push(entry, frame))
                        .count()
                })
                .unwrap_or(0),
            Target::User(principal) => state
                .sessions
                .values()
                .filter(|entry| entry.session.principal() == Some(principal.as_str()))
                .filter(|entry| self.push(entry, frame))
                .count(),
            Target::Session(id) => state
                .sessions
                .get(id)
                .map_or(0, |entry| usize::from(self.push(entry, frame))),
        }
    }

    fn push(&self, entry: &SessionEntry, frame: &Bytes) -> bool {
        match entry.session.try_deliver(frame.clone()) {
            Delivery::Queued => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Delivery::Full => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session = %entry.session.id(), "Session buffer full, dropping message");
                false
            }
            Delivery::Closed => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(session = %entry.session.id(), "Session writer gone, dropping message");
                false
            }
        }
    }

    fn close_all(&self) {
        let mut state = self.shared.state.write();
        if !state.sessions.is_empty() {
            info!(sessions = state.sessions.len(), "Closing all sessions");
        }
        state.sessions.clear();
        state.rooms.clear();
    }
}
