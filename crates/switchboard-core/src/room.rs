//! Rooms: named, dynamically-lived groups of sessions.
//!
//! A room exists only while it has at least one member. It is created on the
//! first join and removed together with its last member.

use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Maximum room name length in bytes.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room name.
///
/// Any non-empty string up to [`MAX_ROOM_NAME_LENGTH`] bytes names a room.
///
/// # Errors
///
/// Returns an error message if the room name is empty or too long.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    Ok(())
}

/// Room membership index: room name to the set of member session IDs.
#[derive(Debug, Default)]
pub struct Rooms {
    members: HashMap<RoomId, HashSet<String>>,
}

impl Rooms {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room if needed.
    ///
    /// Returns `true` if the member was not already in the room.
    pub fn join(&mut self, room: &str, member: &str) -> bool {
        let members = self.members.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating room");
            HashSet::new()
        });
        members.insert(member.to_string())
    }

    /// Remove a member, deleting the room if it becomes empty.
    ///
    /// Returns `true` if the member was in the room.
    pub fn leave(&mut self, room: &str, member: &str) -> bool {
        let Some(members) = self.members.get_mut(room) else {
            return false;
        };

        let removed = members.remove(member);
        if members.is_empty() {
            self.members.remove(room);
            debug!(room = %room, "Deleted empty room");
        }
        removed
    }

    /// Get the members of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Option<&HashSet<String>> {
        self.members.get(room)
    }

    /// Get the number of members in a room (0 if it does not exist).
    #[must_use]
    pub fn size(&self, room: &str) -> usize {
        self.members.get(room).map_or(0, HashSet::len)
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains(&self, room: &str) -> bool {
        self.members.contains_key(room)
    }

    /// Get all room names.
    #[must_use]
    pub fn names(&self) -> Vec<RoomId> {
        self.members.keys().cloned().collect()
    }

    /// Number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Remove every room.
    pub fn clear(&mut self) {
        self.members.clear();
    }
}
