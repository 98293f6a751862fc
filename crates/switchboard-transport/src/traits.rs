//! Connection abstraction traits for Switchboard.
//!
//! A physical connection is split into a reading half and a writing half so
//! that each session duty owns exactly one of them.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Something read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// An application message.
    Message(Bytes),
    /// A keepalive ping from the peer.
    Ping,
    /// A keepalive pong from the peer.
    Pong,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation missed its deadline.
    #[error("Connection timed out")]
    Timeout,

    /// An inbound message exceeded the size limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] switchboard_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text for a frame that is valid UTF-8, otherwise the raw bytes.
pub(crate) fn frame_text(frame: Bytes) -> Result<String, Vec<u8>> {
    String::from_utf8(frame.to_vec()).map_err(|e| e.into_bytes())
}

/// The reading half of a connection.
#[async_trait]
pub trait ConnectionReader: Send + 'static {
    /// Receive the next item.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// The writing half of a connection.
#[async_trait]
pub trait ConnectionWriter: Send + 'static {
    /// Send one encoded frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Send a keepalive ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Send a close frame.
    async fn close(&mut self) -> Result<(), TransportError>;
}
