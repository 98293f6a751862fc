//! # switchboard-protocol
//!
//! Wire envelope for the Switchboard realtime hub.
//!
//! Peers exchange JSON objects of the form
//! `{"type": string, "room": string?, "payload": any?}`. The session control
//! plane interprets a handful of types:
//!
//! - `join` / `leave` - Room membership (`payload.room`)
//! - `ping` - Answered with `{"type":"pong"}`
//! - `broadcast` - Deliver to every connected session
//! - `room` - Deliver to the members of `room`
//!
//! Every other type is passed through to application handlers.
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::join("chat:lobby");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.room_request().as_deref(), Some("chat:lobby"));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_MESSAGE_SIZE};
pub use envelope::{kinds, Envelope, MessageKind, RoomRequest};
