//! Online/offline tracking derived from push events

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use log::debug;
use tokio::sync::broadcast;

use crate::constants::CACHE_EVENT_CAPACITY;
use crate::core::message_types::InboundEvent;
use crate::error::Result;

/// Emitted whenever a user's presence flips
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub online: bool,
}

/// The set of users currently believed to be online.
///
/// Only `user_online` / `user_offline` events change the set. A dropped
/// channel leaves it untouched since remote presence cannot be inferred
/// from a local connection loss.
pub struct PresenceTracker {
    online: RwLock<HashSet<String>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CACHE_EVENT_CAPACITY);
        Self {
            online: RwLock::new(HashSet::new()),
            changes,
        }
    }

    /// Applies a presence event, returns whether the set changed.
    /// Events of other kinds are ignored.
    pub fn apply(&self, event: &InboundEvent) -> Result<bool> {
        match event {
            InboundEvent::UserOnline(p) => self.set_online(&p.user_id),
            InboundEvent::UserOffline(p) => self.set_offline(&p.user_id),
            _ => Ok(false),
        }
    }

    pub fn set_online(&self, user_id: &str) -> Result<bool> {
        let inserted = self.online.write()?.insert(user_id.to_string());
        if inserted {
            debug!("User {} is online", user_id);
            self.notify(user_id, true);
        }
        Ok(inserted)
    }

    pub fn set_offline(&self, user_id: &str) -> Result<bool> {
        let removed = self.online.write()?.remove(user_id);
        if removed {
            debug!("User {} is offline", user_id);
            self.notify(user_id, false);
        }
        Ok(removed)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online
            .read()
            .map(|set| set.contains(user_id))
            .unwrap_or(false)
    }

    /// Snapshot of online users, sorted
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .online
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn count(&self) -> usize {
        self.online.read().map(|set| set.len()).unwrap_or(0)
    }

    /// Forget everyone, used when the session ends
    pub fn clear(&self) -> Result<()> {
        self.online.write()?.clear();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    fn notify(&self, user_id: &str, online: bool) {
        // No receivers is fine
        let _ = self.changes.send(PresenceChange {
            user_id: user_id.to_string(),
            online,
        });
    }
}

/// Thread-safe wrapper for PresenceTracker
pub type SharedPresence = Arc<PresenceTracker>;
