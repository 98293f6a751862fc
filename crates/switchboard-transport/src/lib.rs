//! # switchboard-transport
//!
//! Connection layer for the Switchboard realtime service.
//!
//! A connection is split into a [`ConnectionReader`] and a
//! [`ConnectionWriter`]. [`spawn_session`] registers the connection with the
//! hub and drives both halves:
//!
//! - **WebSocket** - tokio-tungstenite streams and a standalone listener
//! - **Upgraded** - sockets upgraded by an axum route
//!
//! ```rust,ignore
//! use switchboard_transport::{spawn_session, split_upgraded, SessionConfig};
//!
//! async fn on_upgrade(hub: Hub, socket: WebSocket) {
//!     let (reader, writer) = split_upgraded(socket);
//!     let session = spawn_session(&hub, reader, writer, None, SessionConfig::default(), None)
//!         .await?;
//!     session.join().await;
//! }
//! ```

pub mod handler;
pub mod session;
pub mod traits;
pub mod upgrade;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use handler::{BusForwarder, InboundHandler, Origin};
pub use session::{spawn_session, SessionConfig, SessionHandle};
pub use traits::{ConnectionReader, ConnectionWriter, Incoming, TransportError};
pub use upgrade::{split_upgraded, UpgradedReader, UpgradedWriter};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketListener, WebSocketReader, WebSocketWriter};
