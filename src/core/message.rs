//! Entities held in the client cache
//!
//! Field names follow the backend's JSON (`_id`, camelCase) so payloads
//! from request responses and push events deserialize into the same types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimal public profile embedded in other entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(rename = "_id")]
    pub id: String,
    pub author: UserRef,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub likes: Vec<String>,
    #[serde(default)]
    pub bookmarks: Vec<String>,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "closed")]
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(rename = "_id")]
    pub id: String,
    pub creator: UserRef,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<UserRef>,
    #[serde(default)]
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Preview of the newest message shown in chat lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: UserRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: String,
    /// Id of the chat this message belongs to
    pub chat: String,
    pub sender: UserRef,
    pub content: String,
    #[serde(default)]
    pub read_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn preview(&self) -> LastMessage {
        LastMessage {
            id: self.id.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
            sender: UserRef {
                id: self.sender.id.clone(),
                username: self.sender.username.clone(),
                profile: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "_id")]
    pub id: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: UserRef,
    #[serde(default)]
    pub resource: Option<ResourceRef>,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Entity families kept in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Post,
    Issue,
    Chat,
    Message,
    Notification,
    User,
}

/// Stable cache identifier: one entry per (kind, id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn post(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Post, id)
    }

    pub fn issue(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Issue, id)
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Chat, id)
    }

    pub fn message(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Message, id)
    }

    pub fn notification(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Notification, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityKind::User, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// Any cached entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Post(Post),
    Issue(Issue),
    Chat(Chat),
    Message(ChatMessage),
    Notification(Notification),
    User(UserRef),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Post(p) => EntityKey::post(&p.id),
            Self::Issue(i) => EntityKey::issue(&i.id),
            Self::Chat(c) => EntityKey::chat(&c.id),
            Self::Message(m) => EntityKey::message(&m.id),
            Self::Notification(n) => EntityKey::notification(&n.id),
            Self::User(u) => EntityKey::user(&u.id),
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            Self::Post(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_issue(&self) -> Option<&Issue> {
        match self {
            Self::Issue(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_chat(&self) -> Option<&Chat> {
        match self {
            Self::Chat(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&ChatMessage> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Self::Notification(n) => Some(n),
            _ => None,
        }
    }
}

impl From<Post> for Entity {
    fn from(p: Post) -> Self {
        Self::Post(p)
    }
}

impl From<Issue> for Entity {
    fn from(i: Issue) -> Self {
        Self::Issue(i)
    }
}

impl From<Chat> for Entity {
    fn from(c: Chat) -> Self {
        Self::Chat(c)
    }
}

impl From<ChatMessage> for Entity {
    fn from(m: ChatMessage) -> Self {
        Self::Message(m)
    }
}

impl From<Notification> for Entity {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl From<UserRef> for Entity {
    fn from(u: UserRef) -> Self {
        Self::User(u)
    }
}
