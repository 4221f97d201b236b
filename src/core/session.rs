//! Sync session
//!
//! [`SyncSession`] is the root object of the client. It is built once by the
//! application and handed to feature code, which reads the cache, presence
//! and typing state from it and drives mutations and room membership
//! through it.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

use crate::auth::token::inspect_token;
use crate::config::ClientConfig;
use crate::core::connection::{ConnectionManager, ConnectionState, Connector, EventEmitter, SharedConnection};
use crate::core::message::{Chat, Entity, Issue, IssueStatus, Notification, Post, UserRef};
use crate::core::message_types::{EventKind, InboundEvent, OutboundEvent};
use crate::core::presence::{PresenceTracker, SharedPresence};
use crate::core::room::{ChannelMembership, Room, SharedMembership};
use crate::core::router::{EventHandler, EventRouter, SharedRouter, SubscriptionHandle};
use crate::core::typing::{SharedTyping, TypingComposer, TypingTracker};
use crate::error::{Result, SyncError};
use crate::gateway::client::{Gateway, SharedGateway};
use crate::gateway::endpoints::{LoginResult, Page, PageRequest};
use crate::gateway::http::{HttpBackend, ReqwestBackend};
use crate::handlers::websocket::WebSocketConnector;
use crate::storage::cache::{ApplyOutcome, CacheTarget, CollectionKey, EntityCache, SharedCache};
use crate::storage::credentials::{Credentials, FileCredentialStore, MemoryCredentialStore};
use crate::storage::optimistic::{Mutation, MutationEngine, SharedMutationEngine};
use crate::storage::traits::CredentialStore;

/// Builder for [`SyncSession`]. Transports and storage default to the
/// WebSocket connector, the `reqwest` backend and the credential store
/// named by the configuration.
pub struct SyncSessionBuilder {
    config: ClientConfig,
    backend: Option<Arc<dyn HttpBackend>>,
    connector: Option<Arc<dyn Connector>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    self_id: Option<String>,
}

impl SyncSessionBuilder {
    pub fn backend(mut self, backend: Arc<dyn HttpBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Fix the local user id instead of reading it from the access token
    pub fn self_id(mut self, user_id: impl Into<String>) -> Self {
        self.self_id = Some(user_id.into());
        self
    }

    pub fn build(self) -> Result<SyncSession> {
        self.config.validate()?;

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(ReqwestBackend::new()));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let credentials: Arc<dyn CredentialStore> = match (self.credentials, &self.config.credentials_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileCredentialStore::new(path.clone())),
            (None, None) => Arc::new(MemoryCredentialStore::new()),
        };

        let gateway: SharedGateway = Arc::new(Gateway::new(self.config.clone(), backend, credentials.clone()));
        let membership: SharedMembership = Arc::new(ChannelMembership::new());
        let router: SharedRouter = Arc::new(EventRouter::new());
        let connection = ConnectionManager::new(
            &self.config,
            connector,
            credentials.clone(),
            gateway.clone(),
            membership.clone(),
            router.clone(),
        );

        let cache: SharedCache = Arc::new(EntityCache::new());
        let engine: SharedMutationEngine = Arc::new(MutationEngine::new(cache.clone()));
        let presence: SharedPresence = Arc::new(PresenceTracker::new());
        let typing: SharedTyping = Arc::new(TypingTracker::new(self.config.remote_typing_ttl));
        typing.set_self_id(self.self_id.clone())?;

        let session = SyncSession {
            config: self.config,
            credentials,
            gateway,
            connection,
            router,
            membership,
            cache,
            engine,
            presence,
            typing,
            self_id: RwLock::new(self.self_id),
            composers: Mutex::new(HashMap::new()),
        };
        session.register_builtin_handlers()?;
        Ok(session)
    }
}

pub struct SyncSession {
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    gateway: SharedGateway,
    connection: SharedConnection,
    router: SharedRouter,
    membership: SharedMembership,
    cache: SharedCache,
    engine: SharedMutationEngine,
    presence: SharedPresence,
    typing: SharedTyping,
    self_id: RwLock<Option<String>>,
    composers: Mutex<HashMap<String, Arc<TypingComposer>>>,
}

impl SyncSession {
    pub fn builder(config: ClientConfig) -> SyncSessionBuilder {
        SyncSessionBuilder {
            config,
            backend: None,
            connector: None,
            credentials: None,
            self_id: None,
        }
    }

    /// Push events feed the cache and the presence and typing trackers
    fn register_builtin_handlers(&self) -> Result<()> {
        let cache = self.cache.clone();
        let typing = self.typing.clone();
        self.router.register_fn(EventKind::NewMessage, move |event| {
            if let InboundEvent::NewMessage(message) = event {
                if cache.insert_message(message.clone())? == ApplyOutcome::Inserted {
                    typing.on_message(message)?;
                }
            }
            Ok(())
        })?;

        let cache = self.cache.clone();
        self.router.register_fn(EventKind::Notification, move |event| {
            if let InboundEvent::Notification(notification) = event {
                cache.insert_notification(notification.clone())?;
            }
            Ok(())
        })?;

        for kind in [EventKind::UserOnline, EventKind::UserOffline] {
            let presence = self.presence.clone();
            self.router
                .register_fn(kind, move |event| presence.apply(event).map(|_| ()))?;
        }

        for kind in [EventKind::UserTyping, EventKind::UserStopTyping] {
            let typing = self.typing.clone();
            self.router
                .register_fn(kind, move |event| typing.apply(event).map(|_| ()))?;
        }

        Ok(())
    }

    // Accessors

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    pub fn router(&self) -> &SharedRouter {
        &self.router
    }

    pub fn membership(&self) -> &SharedMembership {
        &self.membership
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn mutations(&self) -> &SharedMutationEngine {
        &self.engine
    }

    pub fn presence(&self) -> &SharedPresence {
        &self.presence
    }

    pub fn typing(&self) -> &SharedTyping {
        &self.typing
    }

    pub fn self_id(&self) -> Option<String> {
        self.self_id.read().ok().and_then(|id| id.clone())
    }

    fn set_self_id(&self, user_id: Option<String>) -> Result<()> {
        *self.self_id.write()? = user_id.clone();
        self.typing.set_self_id(user_id)
    }

    // Authentication

    /// Log in with email and password and persist the returned credentials
    pub async fn login(&self, email: &str, password: &str) -> Result<UserRef> {
        let LoginResult { user, credentials } = self.gateway.login(email, password).await?;
        self.credentials.save(&credentials).await?;
        self.set_self_id(Some(user.id.clone()))?;
        self.cache.put(Entity::User(user.clone()))?;
        info!("Logged in as {}", user.username);
        Ok(user)
    }

    /// Persist credentials obtained elsewhere
    pub async fn login_with(&self, credentials: Credentials) -> Result<()> {
        self.credentials.save(&credentials).await?;
        self.adopt_token_identity(&credentials.access_token)
    }

    /// End the session: disconnect, forget the credentials and drop all
    /// cached state. The server is told on a best-effort basis.
    pub async fn logout(&self) -> Result<()> {
        if self.credentials.load().await?.is_some() {
            if let Err(e) = self.gateway.logout().await {
                warn!("Server logout failed: {}", e);
            }
        }

        self.disconnect()?;
        self.credentials.clear().await?;
        self.membership.clear()?;
        self.cache.clear()?;
        self.presence.clear()?;
        self.typing.clear()?;
        self.set_self_id(None)?;
        info!("Logged out");
        Ok(())
    }

    /// Take the local user id from the token's subject unless one is
    /// already known
    fn adopt_token_identity(&self, access_token: &str) -> Result<()> {
        if self.self_id().is_some() {
            return Ok(());
        }
        match inspect_token(access_token) {
            Ok(claims) => self.set_self_id(Some(claims.sub)),
            Err(e) => {
                warn!("Could not read user id from access token: {}", e);
                Ok(())
            }
        }
    }

    // Channel

    /// Connect the push channel and join the local user's room
    pub async fn connect(&self) -> Result<()> {
        let credentials = self
            .credentials
            .load()
            .await?
            .ok_or(SyncError::AuthRequired)?;
        self.adopt_token_identity(&credentials.access_token)?;

        match self.self_id() {
            Some(user_id) => {
                self.membership.insert(Room::user(user_id))?;
            }
            None => warn!("Local user id unknown, not joining a user room"),
        }

        self.connection.connect().await
    }

    /// Close the channel. Typing signals in progress are ended first.
    pub fn disconnect(&self) -> Result<()> {
        let composers: Vec<_> = self.composers.lock()?.drain().map(|(_, c)| c).collect();
        for composer in composers {
            if let Err(e) = composer.finish() {
                debug!("Could not end typing in {}: {}", composer.chat_id(), e);
            }
        }
        self.connection.disconnect()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Result<SubscriptionHandle> {
        self.router.register(kind, handler)
    }

    pub fn subscribe_fn<F>(&self, kind: EventKind, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&InboundEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.router.register_fn(kind, callback)
    }

    pub fn unsubscribe(&self, kind: EventKind, handle: SubscriptionHandle) -> Result<bool> {
        self.router.unregister(kind, handle)
    }

    pub fn join(&self, room: Room) -> Result<bool> {
        self.connection.join(room)
    }

    pub fn leave(&self, room: &Room) -> Result<bool> {
        self.connection.leave(room)
    }

    /// Join a chat's room to receive its messages and typing signals
    pub fn open_chat(&self, chat_id: &str) -> Result<bool> {
        self.join(Room::chat(chat_id))
    }

    /// Leave a chat's room, ending the local typing signal there
    pub fn close_chat(&self, chat_id: &str) -> Result<bool> {
        let composer = self.composers.lock()?.remove(chat_id);
        if let Some(composer) = composer {
            composer.finish()?;
        }
        self.typing.clear_chat(chat_id)?;
        self.leave(&Room::chat(chat_id))
    }

    /// Typing signal for a chat, shared by every caller asking for the
    /// same chat
    pub fn composer(&self, chat_id: &str) -> Result<Arc<TypingComposer>> {
        let mut composers = self.composers.lock()?;
        let composer = composers.entry(chat_id.to_string()).or_insert_with(|| {
            let emitter: Arc<dyn EventEmitter> = self.connection.clone();
            Arc::new(TypingComposer::new(chat_id, self.config.typing_idle, emitter))
        });
        Ok(composer.clone())
    }

    /// Send a chat message over the channel. Ends the local typing signal.
    pub fn send_message(&self, chat_id: &str, content: &str) -> Result<()> {
        let composer = self.composers.lock()?.get(chat_id).cloned();
        if let Some(composer) = composer {
            composer.finish()?;
        }

        self.connection.emit(OutboundEvent::SendMessage {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        })
    }

    // Optimistic mutations

    pub async fn like_post(&self, post_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = post_id.to_string();
        self.mutate(Mutation::LikePost { post_id: id.clone() }, async move {
            gateway.like_post(&id).await.map(|_| None)
        })
        .await
    }

    pub async fn unlike_post(&self, post_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = post_id.to_string();
        self.mutate(Mutation::UnlikePost { post_id: id.clone() }, async move {
            gateway.unlike_post(&id).await.map(|_| None)
        })
        .await
    }

    pub async fn bookmark_post(&self, post_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = post_id.to_string();
        self.mutate(Mutation::BookmarkPost { post_id: id.clone() }, async move {
            gateway.bookmark_post(&id).await.map(|_| None)
        })
        .await
    }

    pub async fn unbookmark_post(&self, post_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = post_id.to_string();
        self.mutate(Mutation::UnbookmarkPost { post_id: id.clone() }, async move {
            gateway.unbookmark_post(&id).await.map(|_| None)
        })
        .await
    }

    pub async fn set_issue_status(&self, issue_id: &str, status: IssueStatus) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = issue_id.to_string();
        let mutation = Mutation::SetIssueStatus {
            issue_id: id.clone(),
            status,
        };
        self.mutate(mutation, async move {
            gateway.update_issue_status(&id, status).await.map(issue_entity)
        })
        .await
    }

    pub async fn add_issue_label(&self, issue_id: &str, label: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let (id, label) = (issue_id.to_string(), label.to_string());
        let mutation = Mutation::AddIssueLabel {
            issue_id: id.clone(),
            label: label.clone(),
        };
        self.mutate(mutation, async move {
            gateway.add_issue_label(&id, &label).await.map(issue_entity)
        })
        .await
    }

    pub async fn remove_issue_label(&self, issue_id: &str, label: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let (id, label) = (issue_id.to_string(), label.to_string());
        let mutation = Mutation::RemoveIssueLabel {
            issue_id: id.clone(),
            label: label.clone(),
        };
        self.mutate(mutation, async move {
            gateway.remove_issue_label(&id, &label).await.map(issue_entity)
        })
        .await
    }

    pub async fn assign_issue(&self, issue_id: &str, user: UserRef) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = issue_id.to_string();
        let user_id = user.id.clone();
        let mutation = Mutation::AssignIssue {
            issue_id: id.clone(),
            user,
        };
        self.mutate(mutation, async move {
            gateway.assign_issue(&id, &user_id).await.map(issue_entity)
        })
        .await
    }

    pub async fn unassign_issue(&self, issue_id: &str, user_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let (id, user_id) = (issue_id.to_string(), user_id.to_string());
        let mutation = Mutation::UnassignIssue {
            issue_id: id.clone(),
            user_id: user_id.clone(),
        };
        self.mutate(mutation, async move {
            gateway.unassign_issue(&id, &user_id).await.map(issue_entity)
        })
        .await
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let gateway = self.gateway.clone();
        let id = notification_id.to_string();
        let mutation = Mutation::MarkNotificationRead {
            notification_id: id.clone(),
        };
        self.mutate(mutation, async move {
            gateway.mark_notification_read(&id).await.map(|_| None)
        })
        .await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        let gateway = self.gateway.clone();
        self.mutate(Mutation::MarkAllNotificationsRead, async move {
            gateway.mark_all_notifications_read().await.map(|_| None)
        })
        .await
    }

    async fn mutate<Fut>(&self, mutation: Mutation, request: Fut) -> Result<()>
    where
        Fut: std::future::Future<Output = Result<Option<Entity>>> + Send + 'static,
    {
        let name = mutation.name();
        let result = self.engine.run(mutation, self.self_id(), request).await;
        if let Err(e) = &result {
            warn!("{} failed and was rolled back: {}", name, e);
        }
        result
    }

    // Fetches

    pub async fn load_post(&self, post_id: &str) -> Result<Post> {
        let post = self.gateway.get_post(post_id).await?;
        self.store(vec![Entity::Post(post.clone())])?;
        Ok(post)
    }

    /// Fetch a page of posts. The first page replaces the cached list,
    /// later pages extend it.
    pub async fn load_posts(&self, page: PageRequest) -> Result<Page<Post>> {
        let result = self.gateway.list_posts(page).await?;
        self.store_page(CollectionKey::Posts, &result)?;
        Ok(result)
    }

    pub async fn load_issue(&self, issue_id: &str) -> Result<Issue> {
        let issue = self.gateway.get_issue(issue_id).await?;
        self.store(vec![Entity::Issue(issue.clone())])?;
        Ok(issue)
    }

    pub async fn load_issues(&self, page: PageRequest) -> Result<Page<Issue>> {
        let result = self.gateway.list_issues(page).await?;
        self.store_page(CollectionKey::Issues, &result)?;
        Ok(result)
    }

    pub async fn load_chats(&self) -> Result<Vec<Chat>> {
        let chats = self.gateway.list_chats().await?;
        let entities = chats.iter().cloned().map(Entity::from).collect();
        self.store_collection(CollectionKey::Chats, entities, 1, 1)?;
        Ok(chats)
    }

    pub async fn load_messages(&self, chat_id: &str, page: PageRequest) -> Result<usize> {
        let messages = self.gateway.get_messages(chat_id, page).await?;
        let count = messages.len();
        let key = CollectionKey::ChatMessages(chat_id.to_string());
        let entities = messages.into_iter().map(Entity::from).collect();
        self.store_collection(key, entities, page.page, page.page)?;
        Ok(count)
    }

    pub async fn load_notifications(&self, page: PageRequest) -> Result<Vec<Notification>> {
        let notifications = self.gateway.list_notifications(page).await?;
        let entities = notifications.iter().cloned().map(Entity::from).collect();
        self.store_collection(CollectionKey::Notifications, entities, page.page, page.page)?;
        Ok(notifications)
    }

    pub async fn load_user(&self, user_id: &str) -> Result<UserRef> {
        let user = self.gateway.get_user(user_id).await?;
        self.store(vec![Entity::User(user.clone())])?;
        Ok(user)
    }

    fn store_page<T>(&self, key: CollectionKey, page: &Page<T>) -> Result<()>
    where
        T: Clone + Into<Entity>,
    {
        let entities = page.items.iter().cloned().map(Into::into).collect();
        self.store_collection(key, entities, page.page, page.total_pages)
    }

    /// Fetched entities go through the engine so pending mutations stay
    /// applied on top of them
    fn store(&self, entities: Vec<Entity>) -> Result<()> {
        self.engine
            .store_fetched(entities, |merged| self.cache.put_many(merged))
    }

    /// The first page replaces the cached list, later pages extend it
    fn store_collection(&self, key: CollectionKey, entities: Vec<Entity>, page: u32, total_pages: u32) -> Result<()> {
        self.engine.store_fetched(entities, |merged| {
            if page <= 1 {
                self.cache.set_collection(key, merged, page, total_pages)
            } else {
                self.cache.extend_collection(key, merged, page, total_pages)
            }
        })
    }

    // Chats

    /// Mark a chat read on the server, then locally for the current user
    pub async fn mark_chat_read(&self, chat_id: &str) -> Result<usize> {
        let user_id = self.self_id().ok_or(SyncError::AuthRequired)?;
        self.gateway.mark_chat_read(chat_id).await?;
        self.cache.mark_chat_read(chat_id, &user_id, Utc::now())
    }

    pub async fn create_group_chat(&self, name: &str, participant_ids: &[String]) -> Result<Chat> {
        let chat = self.gateway.create_group_chat(name, participant_ids).await?;
        self.remember_chat(&chat)?;
        Ok(chat)
    }

    pub async fn direct_chat(&self, user_id: &str) -> Result<Chat> {
        let chat = self.gateway.direct_chat(user_id).await?;
        self.remember_chat(&chat)?;
        Ok(chat)
    }

    fn remember_chat(&self, chat: &Chat) -> Result<()> {
        self.store(vec![Entity::Chat(chat.clone())])?;
        self.cache
            .mark_stale(CacheTarget::Collection(CollectionKey::Chats))
    }
}

fn issue_entity(issue: Issue) -> Option<Entity> {
    Some(Entity::Issue(issue))
}

/// Thread-safe wrapper for SyncSession
pub type SharedSession = Arc<SyncSession>;
