//! The local entity cache
//!
//! One entry per [`EntityKey`]. Collections (lists, per-chat message logs)
//! hold ids only, so every view that shows an entity reads the same entry.
//! Every write is announced on a broadcast channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::broadcast;

use crate::constants::CACHE_EVENT_CAPACITY;
use crate::core::message::{Chat, ChatMessage, Entity, EntityKey, EntityKind, Issue, Notification, Post};
use crate::error::{Result, SyncError};

/// Named lists of entity ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKey {
    Posts,
    Issues,
    Chats,
    /// Message log of one chat, oldest first
    ChatMessages(String),
    /// Newest first
    Notifications,
}

impl CollectionKey {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Posts => EntityKind::Post,
            Self::Issues => EntityKind::Issue,
            Self::Chats => EntityKind::Chat,
            Self::ChatMessages(_) => EntityKind::Message,
            Self::Notifications => EntityKind::Notification,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    pub ids: Vec<String>,
    pub page: u32,
    pub total_pages: u32,
    /// Set when the authoritative contents may differ from what is cached
    pub stale: bool,
}

/// Change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    EntityChanged(EntityKey),
    EntityRemoved(EntityKey),
    CollectionChanged(CollectionKey),
    Stale(CacheTarget),
    Cleared,
}

/// Something that can be marked stale
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTarget {
    Entity(EntityKey),
    Collection(CollectionKey),
}

/// Result of applying a pushed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    /// An entry with the same id already existed, nothing changed
    Duplicate,
}

/// Pre-mutation values of a set of keys, `None` meaning absent
pub type Snapshot = Vec<(EntityKey, Option<Entity>)>;

#[derive(Default)]
struct CacheState {
    entities: HashMap<EntityKey, Entity>,
    collections: HashMap<CollectionKey, Collection>,
    stale: HashSet<EntityKey>,
}

pub struct EntityCache {
    state: RwLock<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CACHE_EVENT_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    // Reads

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.entities.get(key).cloned())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.state
            .read()
            .map(|s| s.entities.contains_key(key))
            .unwrap_or(false)
    }

    pub fn post(&self, id: &str) -> Option<Post> {
        match self.get(&EntityKey::post(id))? {
            Entity::Post(p) => Some(p),
            _ => None,
        }
    }

    pub fn issue(&self, id: &str) -> Option<Issue> {
        match self.get(&EntityKey::issue(id))? {
            Entity::Issue(i) => Some(i),
            _ => None,
        }
    }

    pub fn chat(&self, id: &str) -> Option<Chat> {
        match self.get(&EntityKey::chat(id))? {
            Entity::Chat(c) => Some(c),
            _ => None,
        }
    }

    pub fn message(&self, id: &str) -> Option<ChatMessage> {
        match self.get(&EntityKey::message(id))? {
            Entity::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn notification(&self, id: &str) -> Option<Notification> {
        match self.get(&EntityKey::notification(id))? {
            Entity::Notification(n) => Some(n),
            _ => None,
        }
    }

    /// Keys of every cached entity of one kind, sorted
    pub fn keys_of(&self, kind: EntityKind) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .state
            .read()
            .map(|s| s.entities.keys().filter(|k| k.kind == kind).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.entities.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn collection(&self, key: &CollectionKey) -> Option<Collection> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.collections.get(key).cloned())
    }

    /// Entities of a collection in collection order. Ids whose entry has
    /// gone missing are skipped.
    pub fn collection_entities(&self, key: &CollectionKey) -> Vec<Entity> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let Some(collection) = state.collections.get(key) else {
            return Vec::new();
        };

        let kind = key.entity_kind();
        collection
            .ids
            .iter()
            .filter_map(|id| state.entities.get(&EntityKey::new(kind, id.as_str())).cloned())
            .collect()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.collection_entities(&CollectionKey::Posts)
            .into_iter()
            .filter_map(|e| match e {
                Entity::Post(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.collection_entities(&CollectionKey::Issues)
            .into_iter()
            .filter_map(|e| match e {
                Entity::Issue(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.collection_entities(&CollectionKey::Chats)
            .into_iter()
            .filter_map(|e| match e {
                Entity::Chat(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.collection_entities(&CollectionKey::ChatMessages(chat_id.to_string()))
            .into_iter()
            .filter_map(|e| match e {
                Entity::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.collection_entities(&CollectionKey::Notifications)
            .into_iter()
            .filter_map(|e| match e {
                Entity::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Unread notifications among those cached
    pub fn unread_notifications(&self) -> usize {
        self.state
            .read()
            .map(|s| {
                s.entities
                    .values()
                    .filter(|e| matches!(e, Entity::Notification(n) if !n.is_read))
                    .count()
            })
            .unwrap_or(0)
    }

    // Writes

    /// Store an authoritative entity, replacing any previous value
    pub fn put(&self, entity: Entity) -> Result<()> {
        let key = entity.key();
        let changed = {
            let mut state = self.state.write()?;
            state.stale.remove(&key);
            state.entities.insert(key.clone(), entity.clone()) != Some(entity)
        };

        if changed {
            self.notify(CacheEvent::EntityChanged(key));
        }
        Ok(())
    }

    pub fn put_many<I>(&self, entities: I) -> Result<()>
    where
        I: IntoIterator<Item = Entity>,
    {
        for entity in entities {
            self.put(entity)?;
        }
        Ok(())
    }

    /// Mutate an entry in place. Fails with `NotFound` when absent.
    pub fn update<F>(&self, key: &EntityKey, f: F) -> Result<()>
    where
        F: FnOnce(&mut Entity),
    {
        let changed = {
            let mut state = self.state.write()?;
            let entity = state
                .entities
                .get_mut(key)
                .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
            let before = entity.clone();
            f(entity);
            *entity != before
        };

        if changed {
            self.notify(CacheEvent::EntityChanged(key.clone()));
        }
        Ok(())
    }

    pub fn remove(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let removed = {
            let mut state = self.state.write()?;
            state.stale.remove(key);
            state.entities.remove(key)
        };
        if removed.is_some() {
            self.notify(CacheEvent::EntityRemoved(key.clone()));
        }
        Ok(removed)
    }

    /// Current values of the given keys
    pub fn snapshot(&self, keys: &[EntityKey]) -> Result<Snapshot> {
        let state = self.state.read()?;
        Ok(keys
            .iter()
            .map(|k| (k.clone(), state.entities.get(k).cloned()))
            .collect())
    }

    /// Put every key back to its snapshotted value in one write
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let mut changed = Vec::new();
        {
            let mut state = self.state.write()?;
            for (key, value) in snapshot {
                let current = match value {
                    Some(entity) => state.entities.insert(key.clone(), entity.clone()),
                    None => state.entities.remove(key),
                };
                if current != *value {
                    changed.push(key.clone());
                }
            }
        }

        for key in changed {
            self.notify(CacheEvent::EntityChanged(key));
        }
        Ok(())
    }

    /// Replace a collection with freshly fetched entities
    pub fn set_collection(&self, key: CollectionKey, entities: Vec<Entity>, page: u32, total_pages: u32) -> Result<()> {
        let ids = entities.iter().map(|e| e.key().id).collect();
        self.put_many(entities)?;
        self.state.write()?.collections.insert(
            key.clone(),
            Collection {
                ids,
                page,
                total_pages,
                stale: false,
            },
        );
        self.notify(CacheEvent::CollectionChanged(key));
        Ok(())
    }

    /// Append a further page to a collection
    pub fn extend_collection(&self, key: CollectionKey, entities: Vec<Entity>, page: u32, total_pages: u32) -> Result<()> {
        let ids: Vec<String> = entities.iter().map(|e| e.key().id).collect();
        self.put_many(entities)?;
        {
            let mut state = self.state.write()?;
            let collection = state.collections.entry(key.clone()).or_default();
            for id in ids {
                if !collection.ids.contains(&id) {
                    collection.ids.push(id);
                }
            }
            collection.page = page;
            collection.total_pages = total_pages;
        }
        self.notify(CacheEvent::CollectionChanged(key));
        Ok(())
    }

    pub fn mark_stale(&self, target: CacheTarget) -> Result<()> {
        {
            let mut state = self.state.write()?;
            match &target {
                CacheTarget::Entity(key) => {
                    if !state.entities.contains_key(key) {
                        return Ok(());
                    }
                    state.stale.insert(key.clone());
                }
                CacheTarget::Collection(key) => match state.collections.get_mut(key) {
                    Some(collection) => collection.stale = true,
                    None => return Ok(()),
                },
            }
        }
        self.notify(CacheEvent::Stale(target));
        Ok(())
    }

    pub fn is_stale(&self, target: &CacheTarget) -> bool {
        let Ok(state) = self.state.read() else {
            return false;
        };
        match target {
            CacheTarget::Entity(key) => state.stale.contains(key),
            CacheTarget::Collection(key) => state.collections.get(key).map(|c| c.stale).unwrap_or(false),
        }
    }

    /// Apply a pushed chat message.
    ///
    /// Appends it to the chat's message log and refreshes the chat preview.
    /// A message whose id is already cached is dropped.
    pub fn insert_message(&self, message: ChatMessage) -> Result<ApplyOutcome> {
        let key = EntityKey::message(&message.id);
        let chat_key = EntityKey::chat(&message.chat);
        let log_key = CollectionKey::ChatMessages(message.chat.clone());

        let chat_updated = {
            let mut state = self.state.write()?;
            if state.entities.contains_key(&key) {
                debug!("Dropping duplicate message {}", message.id);
                return Ok(ApplyOutcome::Duplicate);
            }

            let log = state.collections.entry(log_key.clone()).or_insert_with(|| Collection {
                // Only this message is known, the rest of the log was never fetched
                stale: true,
                ..Collection::default()
            });
            log.ids.push(message.id.clone());

            let chat_updated = match state.entities.get_mut(&chat_key) {
                Some(Entity::Chat(chat)) => {
                    chat.last_message = Some(message.preview());
                    chat.updated_at = message.created_at;
                    true
                }
                _ => false,
            };

            state.entities.insert(key.clone(), Entity::Message(message));
            chat_updated
        };

        self.notify(CacheEvent::EntityChanged(key));
        self.notify(CacheEvent::CollectionChanged(log_key));
        if chat_updated {
            self.notify(CacheEvent::EntityChanged(chat_key));
        }
        Ok(ApplyOutcome::Inserted)
    }

    /// Apply a pushed notification, newest first. Duplicates are dropped.
    pub fn insert_notification(&self, notification: Notification) -> Result<ApplyOutcome> {
        let key = EntityKey::notification(&notification.id);
        {
            let mut state = self.state.write()?;
            if state.entities.contains_key(&key) {
                debug!("Dropping duplicate notification {}", notification.id);
                return Ok(ApplyOutcome::Duplicate);
            }

            let list = state
                .collections
                .entry(CollectionKey::Notifications)
                .or_insert_with(|| Collection {
                    stale: true,
                    ..Collection::default()
                });
            list.ids.insert(0, notification.id.clone());
            state.entities.insert(key.clone(), Entity::Notification(notification));
        }

        self.notify(CacheEvent::EntityChanged(key));
        self.notify(CacheEvent::CollectionChanged(CollectionKey::Notifications));
        Ok(ApplyOutcome::Inserted)
    }

    /// Record that a chat was read by `user_id` up to now
    pub fn mark_chat_read(&self, chat_id: &str, user_id: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut touched = Vec::new();
        {
            let mut guard = self.state.write()?;
            let state = &mut *guard;
            let ids = state
                .collections
                .get(&CollectionKey::ChatMessages(chat_id.to_string()))
                .map(|c| c.ids.clone())
                .unwrap_or_default();

            for id in ids {
                let key = EntityKey::message(&id);
                if let Some(Entity::Message(m)) = state.entities.get_mut(&key) {
                    if m.created_at <= at && !m.read_by.iter().any(|u| u == user_id) {
                        m.read_by.push(user_id.to_string());
                        touched.push(key);
                    }
                }
            }
        }

        let count = touched.len();
        for key in touched {
            self.notify(CacheEvent::EntityChanged(key));
        }
        Ok(count)
    }

    /// Drop everything, used on logout
    pub fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.write()?;
            state.entities.clear();
            state.collections.clear();
            state.stale.clear();
        }
        self.notify(CacheEvent::Cleared);
        Ok(())
    }
}

/// Thread-safe wrapper for EntityCache
pub type SharedCache = Arc<EntityCache>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{LastMessage, UserRef};

    fn user(id: &str) -> UserRef {
        UserRef {
            id: id.into(),
            username: format!("{}-name", id),
            profile: None,
        }
    }

    fn chat(id: &str) -> Chat {
        Chat {
            id: id.into(),
            kind: "direct".into(),
            name: None,
            participants: vec![user("u1"), user("u2")],
            last_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(id: &str, chat: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            chat: chat.into(),
            sender: user("u2"),
            content: format!("body of {}", id),
            read_by: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_message_is_dropped() {
        let cache = EntityCache::new();
        assert_eq!(cache.insert_message(message("m1", "c1")).unwrap(), ApplyOutcome::Inserted);
        assert_eq!(cache.insert_message(message("m1", "c1")).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(cache.messages("c1").len(), 1);
    }

    #[test]
    fn test_message_refreshes_chat_preview() {
        let cache = EntityCache::new();
        cache
            .set_collection(CollectionKey::Chats, vec![chat("c1").into()], 1, 1)
            .unwrap();

        let msg = message("m1", "c1");
        cache.insert_message(msg.clone()).unwrap();

        let cached = cache.chat("c1").unwrap();
        let preview: LastMessage = cached.last_message.unwrap();
        assert_eq!(preview.id, "m1");
        assert_eq!(cached.updated_at, msg.created_at);
        assert_eq!(cache.chats().len(), 1);
    }

    #[test]
    fn test_message_for_unfetched_chat_marks_log_stale() {
        let cache = EntityCache::new();
        cache.insert_message(message("m1", "c9")).unwrap();
        let target = CacheTarget::Collection(CollectionKey::ChatMessages("c9".into()));
        assert!(cache.is_stale(&target));
    }

    #[test]
    fn test_notifications_are_newest_first() {
        let cache = EntityCache::new();
        for id in ["n1", "n2"] {
            cache
                .insert_notification(Notification {
                    id: id.into(),
                    recipient: "u1".into(),
                    kind: "like".into(),
                    actor: user("u2"),
                    resource: None,
                    message: "liked your post".into(),
                    is_read: false,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let ids: Vec<String> = cache.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
        assert_eq!(cache.unread_notifications(), 2);
    }

    #[test]
    fn test_restore_brings_back_absent_and_present_values() {
        let cache = EntityCache::new();
        cache.put(chat("c1").into()).unwrap();

        let keys = vec![EntityKey::chat("c1"), EntityKey::chat("c2")];
        let snapshot = cache.snapshot(&keys).unwrap();

        cache.remove(&EntityKey::chat("c1")).unwrap();
        cache.put(chat("c2").into()).unwrap();
        cache.restore(&snapshot).unwrap();

        assert!(cache.contains(&EntityKey::chat("c1")));
        assert!(!cache.contains(&EntityKey::chat("c2")));
    }

    #[test]
    fn test_put_clears_stale_flag() {
        let cache = EntityCache::new();
        cache.put(chat("c1").into()).unwrap();
        let target = CacheTarget::Entity(EntityKey::chat("c1"));

        cache.mark_stale(target.clone()).unwrap();
        assert!(cache.is_stale(&target));

        cache.put(chat("c1").into()).unwrap();
        assert!(!cache.is_stale(&target));
    }

    #[test]
    fn test_update_missing_entry_is_not_found() {
        let cache = EntityCache::new();
        let result = cache.update(&EntityKey::post("p1"), |_| {});
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_changes_are_announced() {
        let cache = EntityCache::new();
        let mut rx = cache.subscribe();
        cache.put(chat("c1").into()).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::EntityChanged(EntityKey::chat("c1"))
        );
    }
}
