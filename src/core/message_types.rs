//! Push channel message types
//!
//! Every frame on the channel is a JSON text frame `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::message::{ChatMessage, Notification};
use crate::error::{Result, SyncError};

/// Client-to-server events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    /// Send a chat message
    #[serde(rename = "send_message", rename_all = "camelCase")]
    SendMessage { chat_id: String, content: String },

    /// Local user started composing in a chat
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { chat_id: String },

    /// Local user stopped composing in a chat
    #[serde(rename = "stop_typing", rename_all = "camelCase")]
    StopTyping { chat_id: String },

    /// Join a non-chat room such as `user:<id>`
    #[serde(rename = "join_room")]
    JoinRoom { room: String },

    /// Join a chat room
    #[serde(rename = "join_chat", rename_all = "camelCase")]
    JoinChat { chat_id: String },

    #[serde(rename = "leave_room")]
    LeaveRoom { room: String },

    #[serde(rename = "leave_chat", rename_all = "camelCase")]
    LeaveChat { chat_id: String },

    /// Announce the local user's presence
    #[serde(rename = "user_online")]
    UserOnline,

    /// Withdraw the local user's presence
    #[serde(rename = "user_offline")]
    UserOffline,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::JoinRoom { .. } => "join_room",
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveRoom { .. } => "leave_room",
            Self::LeaveChat { .. } => "leave_chat",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SyncError::from)
    }
}

/// Names of the server-to-client events feature code can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    NewMessage,
    Notification,
    UserOnline,
    UserOffline,
    UserTyping,
    UserStopTyping,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::NewMessage,
        EventKind::Notification,
        EventKind::UserOnline,
        EventKind::UserOffline,
        EventKind::UserTyping,
        EventKind::UserStopTyping,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::Notification => "notification",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::UserTyping => "user_typing",
            Self::UserStopTyping => "user_stop_typing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Presence payload for `user_online` / `user_offline`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
}

/// Typing payload for `user_typing` / `user_stop_typing`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    pub chat_id: String,
}

/// Server-to-client events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    NewMessage(ChatMessage),
    Notification(Notification),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    UserTyping(TypingPayload),
    UserStopTyping(TypingPayload),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::Notification(_) => EventKind::Notification,
            Self::UserOnline(_) => EventKind::UserOnline,
            Self::UserOffline(_) => EventKind::UserOffline,
            Self::UserTyping(_) => EventKind::UserTyping,
            Self::UserStopTyping(_) => EventKind::UserStopTyping,
        }
    }

    /// Encode as a wire frame, used by tests and loopback transports
    pub fn to_frame(&self) -> Result<String> {
        let data = match self {
            Self::NewMessage(m) => serde_json::to_value(m)?,
            Self::Notification(n) => serde_json::to_value(n)?,
            Self::UserOnline(p) | Self::UserOffline(p) => serde_json::to_value(p)?,
            Self::UserTyping(t) | Self::UserStopTyping(t) => serde_json::to_value(t)?,
        };
        let frame = RawFrame {
            event: self.kind().name().to_string(),
            data,
        };
        serde_json::to_string(&frame).map_err(SyncError::from)
    }
}

/// Envelope shared by every frame
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// A decoded server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Event(InboundEvent),
    /// The server refused the credential the channel was opened with
    AuthRejected(String),
    /// Any other server-reported error
    Error(String),
    /// An event this client does not handle
    Unknown(String),
}

impl ServerFrame {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| SyncError::MessageParseError(format!("Invalid frame: {}", e)))?;

        let frame = match raw.event.as_str() {
            "new_message" => ServerFrame::Event(InboundEvent::NewMessage(
                serde_json::from_value(raw.data)?,
            )),
            "notification" => ServerFrame::Event(InboundEvent::Notification(
                serde_json::from_value(raw.data)?,
            )),
            "user_online" => ServerFrame::Event(InboundEvent::UserOnline(
                serde_json::from_value(raw.data)?,
            )),
            "user_offline" => ServerFrame::Event(InboundEvent::UserOffline(
                serde_json::from_value(raw.data)?,
            )),
            "user_typing" => ServerFrame::Event(InboundEvent::UserTyping(
                serde_json::from_value(raw.data)?,
            )),
            "user_stop_typing" => ServerFrame::Event(InboundEvent::UserStopTyping(
                serde_json::from_value(raw.data)?,
            )),
            "connect_error" | "error" => {
                let message = error_message(&raw.data);
                if is_auth_message(&message) {
                    ServerFrame::AuthRejected(message)
                } else {
                    ServerFrame::Error(message)
                }
            }
            other => ServerFrame::Unknown(other.to_string()),
        };

        Ok(frame)
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Matches the wording servers use for rejected credentials
pub fn is_auth_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("authentication") || lowered.contains("jwt") || lowered.contains("unauthorized")
}
