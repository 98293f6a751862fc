//! Codec for encoding and decoding Switchboard envelopes.
//!
//! Envelopes travel as one JSON document per WebSocket text frame.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Default inbound message size limit (512 KiB).
///
/// The codec itself does not enforce a size; the receiving session does.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Structurally valid JSON that is not a usable envelope.
    #[error("Invalid message: {0}")]
    Invalid(&'static str),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(data))
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is not JSON or has an empty `type` tag.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;

    if envelope.kind.is_empty() {
        return Err(ProtocolError::Invalid("empty message type"));
    }

    Ok(envelope)
}
