//! Message envelope for the Switchboard protocol.
//!
//! Every message exchanged with a peer is a JSON object with a fixed set of
//! field names:
//!
//! ```json
//! {"type": "room", "room": "chat:lobby", "payload": {"text": "hi"}}
//! ```
//!
//! `room` and `payload` are optional and omitted when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Message type tags interpreted by the session control plane.
pub mod kinds {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const BROADCAST: &str = "broadcast";
    pub const ROOM: &str = "room";
    pub const CONNECTED: &str = "connected";
}

/// Classification of an envelope's `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Join the room named in the payload.
    Join,
    /// Leave the room named in the payload.
    Leave,
    /// Keepalive request, answered with `Pong`.
    Ping,
    /// Keepalive reply.
    Pong,
    /// Deliver to every connected session.
    Broadcast,
    /// Deliver to the members of `room`.
    Room,
    /// Server welcome sent after registration.
    Connected,
    /// Any other tag. Passed through to application handlers.
    Other,
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        match tag {
            kinds::JOIN => MessageKind::Join,
            kinds::LEAVE => MessageKind::Leave,
            kinds::PING => MessageKind::Ping,
            kinds::PONG => MessageKind::Pong,
            kinds::BROADCAST => MessageKind::Broadcast,
            kinds::ROOM => MessageKind::Room,
            kinds::CONNECTED => MessageKind::Connected,
            _ => MessageKind::Other,
        }
    }
}

/// Payload shape of `join` and `leave` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    /// Room name.
    pub room: String,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target room, for room-scoped messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Opaque application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Create an envelope with only a type tag.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            room: None,
            payload: None,
        }
    }

    /// Set the target room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the payload from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as JSON.
    pub fn with_payload_of<T: Serialize + ?Sized>(self, payload: &T) -> Result<Self, ProtocolError> {
        let value = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
        Ok(match value {
            Value::Null => self,
            value => self.with_payload(value),
        })
    }

    /// Classify the type tag.
    #[must_use]
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from(self.kind.as_str())
    }

    /// Get the target room, treating an empty name as absent.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref().filter(|r| !r.is_empty())
    }

    /// Extract the room named by a `join` / `leave` request.
    ///
    /// The room is read from `payload.room`; if the payload does not carry
    /// one, the envelope's own `room` field is used.
    #[must_use]
    pub fn room_request(&self) -> Option<String> {
        let from_payload = self
            .payload
            .as_ref()
            .and_then(|p| serde_json::from_value::<RoomRequest>(p.clone()).ok())
            .map(|r| r.room)
            .filter(|r| !r.is_empty());

        from_payload.or_else(|| self.room().map(str::to_string))
    }

    /// Create a `join` request.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        Self::new(kinds::JOIN).with_payload(room_payload(room.into()))
    }

    /// Create a `leave` request.
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        Self::new(kinds::LEAVE).with_payload(room_payload(room.into()))
    }

    /// Create a `ping`.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(kinds::PING)
    }

    /// Create a `pong`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(kinds::PONG)
    }

    /// Create a `broadcast` message.
    #[must_use]
    pub fn broadcast(payload: Value) -> Self {
        Self::new(kinds::BROADCAST).with_payload(payload)
    }

    /// Create a `room` message.
    #[must_use]
    pub fn room_message(room: impl Into<String>, payload: Value) -> Self {
        Self::new(kinds::ROOM).with_room(room).with_payload(payload)
    }

    /// Create the welcome message sent after a session is registered.
    #[must_use]
    pub fn connected(client_id: &str, user_id: Option<&str>) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "message".to_string(),
            Value::from("Connected to Switchboard"),
        );
        payload.insert("client_id".to_string(), Value::from(client_id));
        if let Some(user) = user_id {
            payload.insert("user_id".to_string(), Value::from(user));
        }
        Self::new(kinds::CONNECTED).with_payload(Value::Object(payload))
    }
}

fn room_payload(room: String) -> Value {
    serde_json::json!({ "room": room })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind() {
        assert_eq!(Envelope::join("chat").message_kind(), MessageKind::Join);
        assert_eq!(Envelope::new("typing").message_kind(), MessageKind::Other);
        assert_eq!(MessageKind::from(kinds::CONNECTED), MessageKind::Connected);
    }

    #[test]
    fn test_room_request_from_payload() {
        let env = Envelope::join("chat:lobby");
        assert_eq!(env.room_request(), Some("chat:lobby".to_string()));
    }

    #[test]
    fn test_room_request_falls_back_to_room_field() {
        let env = Envelope::new("join").with_room("chat");
        assert_eq!(env.room_request(), Some("chat".to_string()));

        let env = Envelope::new("join").with_payload(json!({"room": ""}));
        assert_eq!(env.room_request(), None);
    }

    #[test]
    fn test_empty_room_is_absent() {
        let env = Envelope::new("room").with_room("");
        assert_eq!(env.room(), None);
    }

    #[test]
    fn test_with_payload_of_skips_null() {
        let env = Envelope::new("notice").with_payload_of(&()).unwrap();
        assert!(env.payload.is_none());

        let env = Envelope::new("notice").with_payload_of(&vec![1, 2]).unwrap();
        assert_eq!(env.payload, Some(json!([1, 2])));
    }

    #[test]
    fn test_connected_payload() {
        let env = Envelope::connected("sess_1", Some("user-9"));
        let payload = env.payload.unwrap();
        assert_eq!(payload["client_id"], "sess_1");
        assert_eq!(payload["user_id"], "user-9");

        let anon = Envelope::connected("sess_2", None);
        assert!(anon.payload.unwrap().get("user_id").is_none());
    }
}
