//! Session duties: the reader and writer tasks of one live connection.
//!
//! [`spawn_session`] registers a session with the hub and starts two tasks
//! sharing a cancellation token:
//!
//! - the **reader** receives frames, enforces the size limit and liveness
//!   deadline, and turns control messages into hub commands;
//! - the **writer** drains the session's outbound queue to the connection
//!   and sends keepalive pings.
//!
//! Whichever duty ends first cancels the other. The reader always
//! unregisters the session on exit, which closes the outbound queue.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::session::DEFAULT_SESSION_BUFFER;
use switchboard_core::{Hub, HubError, Session, SessionId, Target};
use switchboard_protocol::{codec, Envelope, MessageKind, MAX_MESSAGE_SIZE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::handler::{InboundHandler, Origin};
use crate::traits::{ConnectionReader, ConnectionWriter, Incoming, TransportError};

/// Per-session timing and size limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each write to the connection.
    pub write_timeout: Duration,
    /// Maximum silence from the peer before the session is dropped.
    pub liveness_timeout: Duration,
    /// Interval between keepalive pings. Must be below `liveness_timeout`;
    /// see [`SessionConfig::validate`].
    pub ping_interval: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity.
    pub buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            max_message_size: MAX_MESSAGE_SIZE,
            buffer: DEFAULT_SESSION_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Set the liveness timeout and derive the ping interval (90 % of it).
    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self.ping_interval = timeout.mul_f64(0.9);
        self
    }

    /// Check that the timings can keep an idle peer alive.
    ///
    /// # Errors
    ///
    /// Returns the reason if a timeout is zero or pings would come too late
    /// to beat the liveness deadline.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.liveness_timeout.is_zero() {
            return Err("liveness timeout must be positive");
        }
        if self.write_timeout.is_zero() {
            return Err("write timeout must be positive");
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.liveness_timeout {
            return Err("ping interval must be positive and below the liveness timeout");
        }
        Ok(())
    }
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    token: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionHandle {
    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ask both duties to stop.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Check if the session is ending or has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for both duties to exit.
    pub async fn join(self) {
        for (duty, handle) in [("reader", self.reader), ("writer", self.writer)] {
            if let Err(e) = handle.await {
                error!(session = %self.id, duty, error = %e, "Session task failed");
            }
        }
    }
}

/// Register a session for a connection and start its duties.
///
/// The peer is greeted with a `connected` message carrying its session ID
/// and principal. Envelopes of a type the session does not handle are passed
/// to `inbound`, or dropped when it is `None`.
///
/// # Errors
///
/// Returns an error if the hub has shut down.
pub async fn spawn_session<R, W>(
    hub: &Hub,
    reader: R,
    writer: W,
    principal: Option<String>,
    config: SessionConfig,
    inbound: Option<Arc<dyn InboundHandler>>,
) -> Result<SessionHandle, HubError>
where
    R: ConnectionReader,
    W: ConnectionWriter,
{
    let (session, outbound) = Session::new(principal, config.buffer);
    let id = session.id().to_string();
    let principal = session.principal().map(str::to_string);

    hub.register(session).await?;
    hub.send_to(&id, &Envelope::connected(&id, principal.as_deref()))
        .await?;

    info!(session = %id, principal = ?principal, "Session started");

    let token = CancellationToken::new();

    let writer = tokio::spawn(
        WriteDuty {
            id: id.clone(),
            writer,
            outbound,
            config: config.clone(),
            token: token.clone(),
        }
        .run(),
    );

    let reader = tokio::spawn(
        ReadDuty {
            reader,
            liveness_timeout: config.liveness_timeout,
            max_message_size: config.max_message_size,
            token: token.clone(),
            dispatcher: Dispatcher {
                hub: hub.clone(),
                id: id.clone(),
                principal,
                inbound,
            },
        }
        .run(),
    );

    Ok(SessionHandle {
        id,
        token,
        reader,
        writer,
    })
}

async fn with_deadline<F>(deadline: Duration, op: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    time::timeout(deadline, op)
        .await
        .map_err(|_| TransportError::Timeout)?
}

struct ReadDuty<R> {
    reader: R,
    liveness_timeout: Duration,
    max_message_size: usize,
    token: CancellationToken,
    dispatcher: Dispatcher,
}

impl<R: ConnectionReader> ReadDuty<R> {
    async fn run(self) {
        let ReadDuty {
            mut reader,
            liveness_timeout,
            max_message_size,
            token,
            dispatcher,
        } = self;
        let id = dispatcher.id.as_str();

        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = time::timeout(liveness_timeout, reader.recv()) => received,
            };

            match received {
                Err(_) => {
                    warn!(session = %id, "Session liveness timeout");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(session = %id, error = %e, "Session read failed");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(session = %id, "Peer closed connection");
                    break;
                }
                Ok(Ok(Some(Incoming::Ping | Incoming::Pong))) => {
                    trace!(session = %id, "Keepalive received");
                }
                Ok(Ok(Some(Incoming::Message(data)))) => {
                    if data.len() > max_message_size {
                        let e = TransportError::MessageTooLarge {
                            size: data.len(),
                            max: max_message_size,
                        };
                        warn!(session = %id, error = %e, "Closing session");
                        break;
                    }
                    if let Err(e) = dispatcher.dispatch(data).await {
                        debug!(session = %id, error = %e, "Hub unavailable, closing session");
                        break;
                    }
                }
            }
        }

        token.cancel();
        if let Err(e) = dispatcher.hub.unregister(id).await {
            debug!(session = %id, error = %e, "Unregister skipped");
        }
        info!(session = %id, "Session ended");
    }
}

/// Turns inbound envelopes into hub commands.
struct Dispatcher {
    hub: Hub,
    id: SessionId,
    principal: Option<String>,
    inbound: Option<Arc<dyn InboundHandler>>,
}

impl Dispatcher {
    /// Act on one inbound message. Only a closed hub is an error.
    async fn dispatch(&self, data: Bytes) -> Result<(), HubError> {
        let envelope = match codec::decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Malformed message");
                return Ok(());
            }
        };

        match envelope.message_kind() {
            MessageKind::Join => {
                let Some(room) = envelope.room_request() else {
                    warn!(session = %self.id, "Join without room");
                    return Ok(());
                };
                self.membership(self.hub.join_room(&self.id, &room).await)
            }
            MessageKind::Leave => {
                let Some(room) = envelope.room_request() else {
                    warn!(session = %self.id, "Leave without room");
                    return Ok(());
                };
                self.membership(self.hub.leave_room(&self.id, &room).await)
            }
            MessageKind::Ping => self.hub.send_to(&self.id, &Envelope::pong()).await,
            MessageKind::Broadcast => self.hub.deliver(Target::All, data).await,
            MessageKind::Room => match envelope.room() {
                Some(room) => self.hub.deliver(Target::Room(room.to_string()), data).await,
                None => {
                    debug!(session = %self.id, "Room message without room, ignoring");
                    Ok(())
                }
            },
            MessageKind::Pong | MessageKind::Connected | MessageKind::Other => {
                self.forward(envelope).await;
                Ok(())
            }
        }
    }

    fn membership(&self, result: Result<(), HubError>) -> Result<(), HubError> {
        match result {
            Err(HubError::InvalidRoom(reason)) => {
                warn!(session = %self.id, reason, "Rejected room name");
                Ok(())
            }
            other => other,
        }
    }

    async fn forward(&self, envelope: Envelope) {
        let Some(handler) = &self.inbound else {
            debug!(session = %self.id, kind = %envelope.kind, "Ignoring unhandled message type");
            return;
        };

        let origin = Origin {
            session: &self.id,
            principal: self.principal.as_deref(),
        };
        let kind = envelope.kind.clone();
        if let Err(e) = handler.handle(origin, envelope).await {
            error!(session = %self.id, kind = %kind, error = %e, "Inbound handler failed");
        }
    }
}

struct WriteDuty<W> {
    id: SessionId,
    writer: W,
    outbound: mpsc::Receiver<Bytes>,
    config: SessionConfig,
    token: CancellationToken,
}

impl<W: ConnectionWriter> WriteDuty<W> {
    async fn run(mut self) {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        let deadline = self.config.write_timeout;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                frame = self.outbound.recv() => match frame {
                    Some(frame) => with_deadline(deadline, self.writer.send(frame)).await,
                    None => {
                        debug!(session = %self.id, "Outbound queue closed");
                        break;
                    }
                },
                _ = keepalive.tick() => with_deadline(deadline, self.writer.ping()).await,
            };

            if let Err(e) = result {
                warn!(session = %self.id, error = %e, "Session write failed");
                break;
            }
        }

        self.token.cancel();
        if let Err(e) = with_deadline(deadline, self.writer.close()).await {
            debug!(session = %self.id, error = %e, "Close frame not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use switchboard_core::room::MAX_ROOM_NAME_LENGTH;
    use switchboard_core::HubConfig;
    use switchboard_protocol::kinds;

    /// What the in-memory connection saw written.
    #[derive(Debug, Clone, PartialEq)]
    enum Written {
        Frame(Envelope),
        Ping,
        Close,
    }

    struct MemoryReader(mpsc::UnboundedReceiver<Incoming>);

    #[async_trait]
    impl ConnectionReader for MemoryReader {
        async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    struct MemoryWriter {
        written: mpsc::UnboundedSender<Written>,
        stalled: bool,
    }

    #[async_trait]
    impl ConnectionWriter for MemoryWriter {
        async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
            if self.stalled {
                std::future::pending::<()>().await;
            }
            let envelope = codec::decode(&frame)?;
            self.written
                .send(Written::Frame(envelope))
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn ping(&mut self) -> Result<(), TransportError> {
            self.written
                .send(Written::Ping)
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.written
                .send(Written::Close)
                .map_err(|_| TransportError::ConnectionClosed)
        }
    }

    struct Peer {
        input: mpsc::UnboundedSender<Incoming>,
        output: mpsc::UnboundedReceiver<Written>,
        handle: SessionHandle,
    }

    impl Peer {
        fn send(&self, text: &str) {
            self.input
                .send(Incoming::Message(Bytes::from(text.to_string())))
                .unwrap();
        }

        async fn next(&mut self) -> Written {
            self.output.recv().await.unwrap()
        }

        async fn next_frame(&mut self) -> Envelope {
            match self.next().await {
                Written::Frame(envelope) => envelope,
                other => panic!("expected frame, got {other:?}"),
            }
        }

        /// Round-trip a ping so everything sent before it has been applied.
        async fn settle(&mut self) {
            self.send(r#"{"type":"ping"}"#);
            assert_eq!(self.next_frame().await, Envelope::pong());
        }
    }

    async fn connect_with(
        hub: &Hub,
        principal: Option<&str>,
        config: SessionConfig,
        inbound: Option<Arc<dyn InboundHandler>>,
        stalled: bool,
    ) -> Peer {
        let (input, rx) = mpsc::unbounded_channel();
        let (tx, output) = mpsc::unbounded_channel();
        let handle = spawn_session(
            hub,
            MemoryReader(rx),
            MemoryWriter {
                written: tx,
                stalled,
            },
            principal.map(str::to_string),
            config,
            inbound,
        )
        .await
        .unwrap();
        Peer {
            input,
            output,
            handle,
        }
    }

    async fn connect(hub: &Hub, principal: Option<&str>) -> Peer {
        let mut peer = connect_with(hub, principal, SessionConfig::default(), None, false).await;
        assert_eq!(peer.next_frame().await.kind, kinds::CONNECTED);
        peer
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.liveness_timeout, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Duration::from_secs(54));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.buffer, 256);
    }

    #[tokio::test]
    async fn test_welcome_message() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer =
            connect_with(&hub, Some("alice"), SessionConfig::default(), None, false).await;

        let welcome = peer.next_frame().await;
        assert_eq!(welcome.kind, kinds::CONNECTED);
        let payload = welcome.payload.unwrap();
        assert_eq!(payload["client_id"], peer.handle.id());
        assert_eq!(payload["user_id"], "alice");
        assert!(hub.is_connected(peer.handle.id()));
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;

        peer.send(r#"{"type":"ping"}"#);
        assert_eq!(peer.next_frame().await, Envelope::pong());
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_session() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;

        peer.send("not json");
        peer.send(r#"{"payload":1}"#);
        peer.settle().await;
        assert!(hub.is_connected(peer.handle.id()));
    }

    #[tokio::test]
    async fn test_room_messages_reach_members_only() {
        let hub = Hub::spawn(HubConfig::default());
        let mut member = connect(&hub, None).await;
        let mut outsider = connect(&hub, None).await;

        member.send(r#"{"type":"join","payload":{"room":"chat"}}"#);
        member.settle().await;
        assert_eq!(hub.room_size("chat"), 1);

        outsider.send(r#"{"type":"room","room":"chat","payload":"hi"}"#);
        let message = member.next_frame().await;
        assert_eq!(message.kind, kinds::ROOM);
        assert_eq!(message.payload, Some(json!("hi")));

        outsider.settle().await;
        assert!(outsider.output.try_recv().is_err());

        member.send(r#"{"type":"leave","room":"chat"}"#);
        member.settle().await;
        assert_eq!(hub.room_size("chat"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = Hub::spawn(HubConfig::default());
        let mut a = connect(&hub, None).await;
        let mut b = connect(&hub, None).await;

        a.send(r#"{"type":"broadcast","payload":{"n":1}}"#);
        assert_eq!(a.next_frame().await.kind, kinds::BROADCAST);
        assert_eq!(b.next_frame().await.payload, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_invalid_room_is_ignored() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;

        let long_room = "r".repeat(MAX_ROOM_NAME_LENGTH + 1);
        peer.send(&format!(r#"{{"type":"join","payload":{{"room":"{long_room}"}}}}"#));
        peer.send(r#"{"type":"join"}"#);
        peer.settle().await;
        assert!(hub.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_goes_to_handler() {
        struct Recorder(mpsc::UnboundedSender<(String, Envelope)>);

        #[async_trait]
        impl InboundHandler for Recorder {
            async fn handle(&self, origin: Origin<'_>, envelope: Envelope) -> anyhow::Result<()> {
                self.0.send((origin.session.to_string(), envelope))?;
                Ok(())
            }
        }

        let hub = Hub::spawn(HubConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = connect_with(
            &hub,
            None,
            SessionConfig::default(),
            Some(Arc::new(Recorder(tx))),
            false,
        )
        .await;
        peer.next_frame().await;

        peer.send(r#"{"type":"typing","payload":true}"#);
        let (session, envelope) = rx.recv().await.unwrap();
        assert_eq!(session, peer.handle.id());
        assert_eq!(envelope.kind, "typing");
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;
        let id = peer.handle.id().to_string();

        drop(peer.input);
        peer.handle.join().await;
        hub.sync().await.unwrap();

        assert!(!hub.is_connected(&id));
        assert_eq!(peer.output.recv().await, Some(Written::Close));
    }

    #[tokio::test]
    async fn test_oversized_message_closes_session() {
        let hub = Hub::spawn(HubConfig::default());
        let config = SessionConfig {
            max_message_size: 16,
            ..SessionConfig::default()
        };
        let peer = connect_with(&hub, None, config, None, false).await;

        peer.send(r#"{"type":"broadcast","payload":"far too long"}"#);
        peer.handle.join().await;
        hub.sync().await.unwrap();
        assert_eq!(hub.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_raised_size_limit_accepts_large_frames() {
        let hub = Hub::spawn(HubConfig::default());
        let config = SessionConfig {
            max_message_size: 2 * 1024 * 1024,
            ..SessionConfig::default()
        };
        let mut peer = connect_with(&hub, None, config, None, false).await;
        assert_eq!(peer.next_frame().await.kind, kinds::CONNECTED);

        let text = "z".repeat(600 * 1024);
        peer.send(&format!(r#"{{"type":"broadcast","payload":"{text}"}}"#));

        let echoed = peer.next_frame().await;
        assert_eq!(echoed.kind, kinds::BROADCAST);
        assert_eq!(echoed.payload, Some(json!(text)));
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::default()
            .with_liveness_timeout(Duration::from_secs(5))
            .validate()
            .is_ok());

        let zero = SessionConfig::default().with_liveness_timeout(Duration::ZERO);
        assert!(zero.validate().is_err());

        let late_ping = SessionConfig {
            ping_interval: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        assert!(late_ping.validate().is_err());

        let no_write_deadline = SessionConfig {
            write_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(no_write_deadline.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_after_keepalive() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;
        let id = peer.handle.id().to_string();

        let started = Instant::now();
        peer.handle.join().await;
        assert!(started.elapsed() >= Duration::from_secs(60));

        assert_eq!(peer.output.recv().await, Some(Written::Ping));
        hub.sync().await.unwrap();
        assert!(!hub.is_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_liveness() {
        let hub = Hub::spawn(HubConfig::default());
        let peer = connect(&hub, None).await;

        time::sleep(Duration::from_secs(40)).await;
        peer.input.send(Incoming::Pong).unwrap();
        time::sleep(Duration::from_secs(40)).await;

        assert!(hub.is_connected(peer.handle.id()));
        assert!(!peer.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_closes_session() {
        let hub = Hub::spawn(HubConfig::default());
        let peer = connect_with(&hub, None, SessionConfig::default(), None, true).await;
        let id = peer.handle.id().to_string();

        let started = Instant::now();
        peer.handle.join().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(60));

        hub.sync().await.unwrap();
        assert!(!hub.is_connected(&id));
    }

    #[tokio::test]
    async fn test_close_handle() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;

        peer.handle.close();
        peer.handle.join().await;
        assert_eq!(peer.output.recv().await, Some(Written::Close));
        hub.sync().await.unwrap();
        assert_eq!(hub.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_session() {
        let hub = Hub::spawn(HubConfig::default());
        let mut peer = connect(&hub, None).await;

        hub.shutdown().await.unwrap();
        assert_eq!(peer.next().await, Written::Close);
        peer.handle.join().await;
    }
}
