//! Core functionality of the sync client

pub mod connection;
pub mod message;
pub mod message_types;
pub mod presence;
pub mod room;
pub mod router;
pub mod session;
pub mod typing;

// Re-export main components for convenience
pub use connection::{
    ConnectionManager, ConnectionState, Connector, CredentialRenewer, EventEmitter, FailureReason, Link, LinkPeer,
    SharedConnection,
};
pub use message::{Chat, ChatMessage, Entity, EntityKey, EntityKind, Issue, IssueStatus, Notification, Post, UserRef};
pub use message_types::{EventKind, InboundEvent, OutboundEvent, ServerFrame};
pub use presence::{PresenceChange, PresenceTracker, SharedPresence};
pub use room::{ChannelMembership, Room, SharedMembership};
pub use router::{DispatchReport, EventHandler, EventRouter, SharedRouter, SubscriptionHandle};
pub use session::{SharedSession, SyncSession, SyncSessionBuilder};
pub use typing::{SharedTyping, TypingComposer, TypingTracker};
