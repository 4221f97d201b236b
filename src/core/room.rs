use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::core::message_types::OutboundEvent;
use crate::error::{Result, SyncError};

/// A logical subscription scope on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// Personal room for notifications addressed to one user
    User(String),
    /// One conversation
    Chat(String),
}

impl Room {
    pub fn user(id: impl Into<String>) -> Self {
        Room::User(id.into())
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Room::Chat(id.into())
    }

    /// Event that subscribes the channel to this room
    pub fn join_event(&self) -> OutboundEvent {
        match self {
            Room::Chat(id) => OutboundEvent::JoinChat {
                chat_id: id.clone(),
            },
            Room::User(_) => OutboundEvent::JoinRoom {
                room: self.to_string(),
            },
        }
    }

    /// Event that unsubscribes the channel from this room
    pub fn leave_event(&self) -> OutboundEvent {
        match self {
            Room::Chat(id) => OutboundEvent::LeaveChat {
                chat_id: id.clone(),
            },
            Room::User(_) => OutboundEvent::LeaveRoom {
                room: self.to_string(),
            },
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Chat(id) => write!(f, "chat:{}", id),
        }
    }
}

impl FromStr for Room {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Room::User(id.to_string())),
            Some(("chat", id)) if !id.is_empty() => Ok(Room::Chat(id.to_string())),
            _ => Err(SyncError::MessageParseError(format!(
                "Invalid room identifier '{}'",
                s
            ))),
        }
    }
}

/// The set of rooms the connection should belong to.
///
/// Feature code mutates the set; the connection manager replays it after
/// every successful (re)connect. The set outlives individual connections.
#[derive(Debug, Default)]
pub struct ChannelMembership {
    rooms: Mutex<BTreeSet<Room>>,
}

impl ChannelMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a room, returns false if it was already a member
    pub fn insert(&self, room: Room) -> Result<bool> {
        Ok(self.rooms.lock()?.insert(room))
    }

    /// Removes a room, returns false if it was not a member
    pub fn remove(&self, room: &Room) -> Result<bool> {
        Ok(self.rooms.lock()?.remove(room))
    }

    pub fn contains(&self, room: &Room) -> Result<bool> {
        Ok(self.rooms.lock()?.contains(room))
    }

    /// Snapshot of the current membership, in stable order
    pub fn rooms(&self) -> Result<Vec<Room>> {
        Ok(self.rooms.lock()?.iter().cloned().collect())
    }

    /// Join events for every room, used when replaying onto a new channel
    pub fn replay_events(&self) -> Result<Vec<OutboundEvent>> {
        Ok(self.rooms.lock()?.iter().map(Room::join_event).collect())
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<()> {
        self.rooms.lock()?.clear();
        Ok(())
    }
}

/// Thread-safe wrapper for ChannelMembership
pub type SharedMembership = Arc<ChannelMembership>;
