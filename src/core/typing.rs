//! Typing indicators
//!
//! [`TypingTracker`] keeps the remote "is typing" sets per chat.
//! [`TypingComposer`] throttles the local user's own typing signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::CACHE_EVENT_CAPACITY;
use crate::core::connection::EventEmitter;
use crate::core::message::ChatMessage;
use crate::core::message_types::{InboundEvent, OutboundEvent, TypingPayload};
use crate::error::Result;

// chat id -> user id -> expiry
type TypingSets = Arc<Mutex<HashMap<String, HashMap<String, Instant>>>>;

/// Remote typing state per chat, with entries that expire on their own
pub struct TypingTracker {
    ttl: Duration,
    self_id: RwLock<Option<String>>,
    chats: TypingSets,
    // One expiry task per chat with live entries
    sweepers: Mutex<HashMap<String, JoinHandle<()>>>,
    changes: broadcast::Sender<String>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(CACHE_EVENT_CAPACITY);
        Self {
            ttl,
            self_id: RwLock::new(None),
            chats: Arc::new(Mutex::new(HashMap::new())),
            sweepers: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// The local user, who is never reported as typing
    pub fn set_self_id(&self, user_id: Option<String>) -> Result<()> {
        *self.self_id.write()? = user_id;
        Ok(())
    }

    /// Applies a typing or message event, returns whether any set changed
    pub fn apply(&self, event: &InboundEvent) -> Result<bool> {
        match event {
            InboundEvent::UserTyping(p) => self.start(p),
            InboundEvent::UserStopTyping(p) => self.stop(&p.chat_id, &p.user_id),
            InboundEvent::NewMessage(m) => self.on_message(m),
            _ => Ok(false),
        }
    }

    fn start(&self, payload: &TypingPayload) -> Result<bool> {
        if self.is_self(&payload.user_id) {
            return Ok(false);
        }

        let now = Instant::now();
        let added = {
            let mut chats = self.chats.lock()?;
            let users = chats.entry(payload.chat_id.clone()).or_default();
            let pruned = prune(users, now);
            let fresh = users
                .insert(payload.user_id.clone(), now + self.ttl)
                .is_none();
            pruned || fresh
        };

        self.arm_sweeper(&payload.chat_id)?;
        if added {
            debug!("{} is typing in {}", payload.user_id, payload.chat_id);
            self.notify(&payload.chat_id);
        }
        Ok(added)
    }

    pub fn stop(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        let mut chats = self.chats.lock()?;
        let removed = match chats.get_mut(chat_id) {
            Some(users) => {
                let removed = users.remove(user_id).is_some();
                if users.is_empty() {
                    chats.remove(chat_id);
                }
                removed
            }
            None => false,
        };
        drop(chats);

        if removed {
            self.notify(chat_id);
        }
        Ok(removed)
    }

    /// A message from a user ends their typing in that chat
    pub fn on_message(&self, message: &ChatMessage) -> Result<bool> {
        self.stop(&message.chat, &message.sender.id)
    }

    /// Users currently typing in a chat, sorted
    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let now = Instant::now();
        let Ok(chats) = self.chats.lock() else {
            return Vec::new();
        };

        let mut typing: Vec<String> = chats
            .get(chat_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        typing.sort();
        typing
    }

    pub fn is_typing(&self, chat_id: &str, user_id: &str) -> bool {
        self.typing_users(chat_id).iter().any(|u| u == user_id)
    }

    pub fn clear_chat(&self, chat_id: &str) -> Result<()> {
        if let Some(sweeper) = self.sweepers.lock()?.remove(chat_id) {
            sweeper.abort();
        }
        if self.chats.lock()?.remove(chat_id).is_some() {
            self.notify(chat_id);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        for (_, sweeper) in self.sweepers.lock()?.drain() {
            sweeper.abort();
        }
        self.chats.lock()?.clear();
        Ok(())
    }

    /// Receives the id of every chat whose typing set changed, including
    /// when entries expire
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn is_self(&self, user_id: &str) -> bool {
        self.self_id
            .read()
            .map(|me| me.as_deref() == Some(user_id))
            .unwrap_or(false)
    }

    fn notify(&self, chat_id: &str) {
        let _ = self.changes.send(chat_id.to_string());
    }

    /// Make sure an expiry task watches `chat_id`. Outside a runtime the
    /// entries still stop counting once expired but nobody is notified.
    fn arm_sweeper(&self, chat_id: &str) -> Result<()> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(());
        };

        let mut sweepers = self.sweepers.lock()?;
        if sweepers.get(chat_id).is_some_and(|s| !s.is_finished()) {
            return Ok(());
        }

        let task = runtime.spawn(sweep(
            chat_id.to_string(),
            self.chats.clone(),
            self.changes.clone(),
        ));
        sweepers.insert(chat_id.to_string(), task);
        Ok(())
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        if let Ok(mut sweepers) = self.sweepers.lock() {
            for (_, sweeper) in sweepers.drain() {
                sweeper.abort();
            }
        }
    }
}

/// Drop expired entries, returns whether any were removed
fn prune(users: &mut HashMap<String, Instant>, now: Instant) -> bool {
    let before = users.len();
    users.retain(|_, expires| *expires > now);
    users.len() != before
}

/// Sleeps until the next entry of `chat_id` expires and announces it, until
/// the chat has nobody typing
async fn sweep(chat_id: String, chats: TypingSets, changes: broadcast::Sender<String>) {
    loop {
        let next = match chats.lock() {
            Ok(chats) => chats
                .get(&chat_id)
                .and_then(|users| users.values().min().copied()),
            Err(_) => return,
        };
        let Some(deadline) = next else {
            return;
        };

        tokio::time::sleep_until(deadline).await;

        let (expired, remaining) = {
            let Ok(mut chats) = chats.lock() else {
                return;
            };
            let Some(users) = chats.get_mut(&chat_id) else {
                return;
            };
            let expired = prune(users, Instant::now());
            let remaining = !users.is_empty();
            if !remaining {
                chats.remove(&chat_id);
            }
            (expired, remaining)
        };

        if expired {
            debug!("Typing expired in {}", chat_id);
            let _ = changes.send(chat_id.clone());
        }
        if !remaining {
            return;
        }
    }
}

/// Thread-safe wrapper for TypingTracker
pub type SharedTyping = Arc<TypingTracker>;

#[derive(Default)]
struct ComposerState {
    active: bool,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// Local typing signal for one chat.
///
/// The first keystroke emits `typing`; later keystrokes only push the idle
/// deadline back. `stop_typing` goes out once the deadline passes, or when
/// the message is sent.
pub struct TypingComposer {
    chat_id: String,
    idle: Duration,
    emitter: Arc<dyn EventEmitter>,
    state: Arc<Mutex<ComposerState>>,
}

impl TypingComposer {
    pub fn new(chat_id: impl Into<String>, idle: Duration, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            chat_id: chat_id.into(),
            idle,
            emitter,
            state: Arc::new(Mutex::new(ComposerState::default())),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn is_typing(&self) -> bool {
        self.state.lock().map(|s| s.active).unwrap_or(false)
    }

    /// Records a keystroke. Must be called from within a tokio runtime.
    pub fn keystroke(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.deadline = Some(Instant::now() + self.idle);

        if state.active {
            return Ok(());
        }

        self.emitter.emit(OutboundEvent::Typing {
            chat_id: self.chat_id.clone(),
        })?;
        state.active = true;
        state.timer = Some(tokio::spawn(idle_timer(
            self.chat_id.clone(),
            self.state.clone(),
            self.emitter.clone(),
        )));
        Ok(())
    }

    /// Ends the typing signal right away, e.g. when the message is sent
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.active {
            return Ok(());
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.active = false;
        state.deadline = None;
        drop(state);

        self.emitter.emit(OutboundEvent::StopTyping {
            chat_id: self.chat_id.clone(),
        })
    }
}

impl Drop for TypingComposer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            debug!("Could not send stop_typing for {}: {}", self.chat_id, e);
        }
    }
}

async fn idle_timer(chat_id: String, state: Arc<Mutex<ComposerState>>, emitter: Arc<dyn EventEmitter>) {
    loop {
        let deadline = match state.lock() {
            Ok(s) => match s.deadline {
                Some(deadline) => deadline,
                None => return,
            },
            Err(_) => return,
        };

        tokio::time::sleep_until(deadline).await;

        let Ok(mut s) = state.lock() else {
            return;
        };
        // A keystroke during the sleep moved the deadline
        if s.deadline.map(|d| d > Instant::now()).unwrap_or(false) {
            continue;
        }
        s.active = false;
        s.deadline = None;
        s.timer = None;
        drop(s);

        if let Err(e) = emitter.emit(OutboundEvent::StopTyping {
            chat_id: chat_id.clone(),
        }) {
            warn!("Failed to send stop_typing for {}: {}", chat_id, e);
        }
        return;
    }
}
