//! Push channel connection management
//!
//! A [`ConnectionManager`] owns the single authenticated channel to the
//! server. A supervisor task opens the channel, replays room membership,
//! pumps inbound frames into the event router and reconnects with backoff
//! when the channel drops. Its lifecycle is a guarded state machine
//! published on a watch channel.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::core::message_types::{OutboundEvent, ServerFrame};
use crate::core::room::{Room, SharedMembership};
use crate::core::router::SharedRouter;
use crate::error::{Result, SyncError};
use crate::storage::traits::CredentialStore;

/// Anything that can put an event on the channel
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: OutboundEvent) -> Result<()>;
}

/// Why the connection gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The credential was rejected and could not be renewed
    AuthRequired,
    /// Every reconnect attempt failed
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Channel lost. `attempt` is the backoff attempt in progress, 0 right
    /// after the loss before any delay.
    Reconnecting { attempt: u32 },
    Failed(FailureReason),
}

impl ConnectionState {
    /// Transition guard for the connection lifecycle
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected, Disconnected) => false,
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Failed(_), Connecting) => true,
            (Connecting, Connected) | (Reconnecting { .. }, Connected) => true,
            (Connecting, Reconnecting { .. }) | (Connected, Reconnecting { .. }) => true,
            (Reconnecting { attempt: a }, Reconnecting { attempt: b }) => b > a,
            (Connecting, Failed(_)) | (Connected, Failed(_)) | (Reconnecting { .. }, Failed(_)) => true,
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            Self::Failed(FailureReason::AuthRequired) => write!(f, "failed (authentication required)"),
            Self::Failed(FailureReason::RetriesExhausted) => write!(f, "failed (retries exhausted)"),
        }
    }
}

/// An open channel as seen by the connection manager.
///
/// Text frames written to `outbound` go to the server; frames from the
/// server arrive on `inbound`. The channel is over once `inbound` yields
/// `None`.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// The transport side of a [`Link`]
pub struct LinkPeer {
    /// Frames the client sent
    pub sent: mpsc::UnboundedReceiver<String>,
    /// Push frames towards the client; drop to close the link
    pub push: mpsc::UnboundedSender<String>,
}

impl Link {
    pub fn pair() -> (Link, LinkPeer) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (push, inbound) = mpsc::unbounded_channel();
        (Link { outbound, inbound }, LinkPeer { sent, push })
    }
}

/// Opens channels to the server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel authenticated with `access_token`. A credential
    /// rejected during the handshake must surface as
    /// [`SyncError::Unauthorized`].
    async fn open(&self, url: &Url, access_token: &str) -> Result<Link>;
}

/// Renews the access credential, storing the result in the credential store
#[async_trait]
pub trait CredentialRenewer: Send + Sync {
    /// Replace `rejected_token`. If the stored credential already differs
    /// from it, someone else renewed in the meantime and that result is used.
    async fn renew(&self, rejected_token: &str) -> Result<()>;
}

#[derive(Debug)]
enum LinkEnd {
    /// The manager moved on (disconnect or a newer connect)
    Superseded,
    Closed,
    AuthRejected(String),
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<OutboundEvent>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    socket_url: Url,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    renewer: Arc<dyn CredentialRenewer>,
    membership: SharedMembership,
    router: SharedRouter,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        renewer: Arc<dyn CredentialRenewer>,
        membership: SharedMembership,
        router: SharedRouter,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(Self {
            socket_url: config.socket_url.clone(),
            policy: config.reconnect.clone(),
            connector,
            credentials,
            renewer,
            membership,
            router,
            state_tx,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                queue: VecDeque::new(),
                supervisor: None,
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn membership(&self) -> &SharedMembership {
        &self.membership
    }

    pub fn router(&self) -> &SharedRouter {
        &self.router
    }

    /// Events waiting for the channel to come up
    pub fn queued(&self) -> usize {
        self.inner.lock().map(|i| i.queue.len()).unwrap_or(0)
    }

    /// Open the channel and wait until it is connected or has failed.
    ///
    /// Returns immediately if already connected; joins the attempt in
    /// progress if one is running.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.credentials.load().await?.is_none() {
            warn!("Cannot open channel without credentials");
            return Err(SyncError::AuthRequired);
        }

        let mut state_rx = self.state_tx.subscribe();
        {
            let mut inner = self.inner.lock()?;
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    debug!("Connection already in progress");
                }
                ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    self.transition(&mut inner, ConnectionState::Connecting);
                    inner.supervisor = Some(tokio::spawn(self.clone().supervise(generation)));
                }
            }
        }

        wait_settled(&mut state_rx).await
    }

    /// Close the channel. Membership and event registrations are kept so a
    /// later [`connect`](Self::connect) restores them. Safe to call twice.
    pub fn disconnect(&self) -> Result<()> {
        let supervisor = {
            let mut guard = self.inner.lock()?;
            let inner = &mut *guard;
            if inner.state == ConnectionState::Disconnected {
                debug!("Channel already disconnected");
                return Ok(());
            }

            inner.generation += 1;
            if let Some(outbound) = inner.outbound.take() {
                // Last frame before the writer sees the sender drop
                if let Ok(frame) = OutboundEvent::UserOffline.to_frame() {
                    let _ = outbound.send(frame);
                }
            }
            inner.queue.clear();
            self.transition(inner, ConnectionState::Disconnected);
            inner.supervisor.take()
        };

        if let Some(handle) = supervisor {
            handle.abort();
        }
        Ok(())
    }

    /// Add a room to the membership, joining right away when connected
    pub fn join(&self, room: Room) -> Result<bool> {
        let added = self.membership.insert(room.clone())?;
        if added {
            debug!("Joining {}", room);
            self.send_if_connected(room.join_event())?;
        }
        Ok(added)
    }

    /// Remove a room from the membership, leaving right away when connected
    pub fn leave(&self, room: &Room) -> Result<bool> {
        let removed = self.membership.remove(room)?;
        if removed {
            debug!("Leaving {}", room);
            self.send_if_connected(room.leave_event())?;
        }
        Ok(removed)
    }

    fn send_if_connected(&self, event: OutboundEvent) -> Result<()> {
        let inner = self.inner.lock()?;
        if inner.state.is_connected() {
            if let Some(outbound) = &inner.outbound {
                // A dead link is covered by the replay on reconnect
                let _ = outbound.send(event.to_frame()?);
            }
        }
        Ok(())
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) -> bool {
        if !inner.state.can_transition_to(&next) {
            debug!("Ignoring transition {} -> {}", inner.state, next);
            return false;
        }

        info!("Connection state: {} -> {}", inner.state, next);
        inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .lock()
            .map(|i| i.generation == generation)
            .unwrap_or(false)
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        let mut attempt: u32 = 0;
        let mut renewed = false;

        loop {
            let token = match self.credentials.load().await {
                Ok(Some(credentials)) => credentials.access_token,
                Ok(None) => {
                    warn!("Credentials disappeared, channel needs re-authentication");
                    self.fail(generation, FailureReason::AuthRequired);
                    return;
                }
                Err(e) => {
                    error!("Failed to load credentials: {}", e);
                    self.fail(generation, FailureReason::AuthRequired);
                    return;
                }
            };

            let failure = match self.connector.open(&self.socket_url, &token).await {
                Ok(link) => match self.run_link(generation, link).await {
                    Ok(LinkEnd::Superseded) => return,
                    Ok(LinkEnd::Closed) => {
                        attempt = 0;
                        renewed = false;
                        SyncError::ConnectionClosed
                    }
                    Ok(LinkEnd::AuthRejected(message)) => {
                        // The link was up, so this is a fresh expiry
                        attempt = 0;
                        renewed = false;
                        SyncError::Unauthorized(message)
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !self.is_current(generation) {
                return;
            }

            if failure.is_auth_failure() {
                if renewed {
                    warn!("Channel rejected the renewed credential: {}", failure);
                    self.give_up_auth(generation).await;
                    return;
                }

                renewed = true;
                info!("Channel rejected credential ({}), renewing", failure);
                match self.renewer.renew(&token).await {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!("Credential renewal failed: {}", e);
                        self.give_up_auth(generation).await;
                        return;
                    }
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                error!(
                    "Giving up on channel after {} reconnect attempts",
                    self.policy.max_attempts
                );
                self.fail(generation, FailureReason::RetriesExhausted);
                return;
            }

            if !self.enter_reconnecting(generation, attempt) {
                return;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "Channel unavailable ({}), reconnect attempt {}/{} in {:?}",
                failure, attempt, self.policy.max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one open link until it ends. Errors mean the link never got
    /// established.
    async fn run_link(&self, generation: u64, link: Link) -> Result<LinkEnd> {
        let Link {
            outbound,
            mut inbound,
        } = link;

        if !self.establish(generation, &outbound)? {
            return Ok(LinkEnd::Superseded);
        }

        while let Some(text) = inbound.recv().await {
            match ServerFrame::parse(&text) {
                Ok(ServerFrame::Event(event)) => {
                    let report = self.router.dispatch(&event);
                    debug!(
                        "Dispatched {} to {} handlers ({} failed)",
                        event.kind(),
                        report.delivered,
                        report.failed
                    );
                }
                Ok(ServerFrame::AuthRejected(message)) => {
                    return Ok(if self.detach(generation) {
                        LinkEnd::AuthRejected(message)
                    } else {
                        LinkEnd::Superseded
                    });
                }
                Ok(ServerFrame::Error(message)) => warn!("Server reported: {}", message),
                Ok(ServerFrame::Unknown(name)) => debug!("Ignoring unhandled event '{}'", name),
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }

        Ok(if self.detach(generation) {
            LinkEnd::Closed
        } else {
            LinkEnd::Superseded
        })
    }

    /// Replay membership and presence, flush queued events, then declare
    /// the channel connected. Runs under the state lock so no join can slip
    /// between the replay and the transition.
    fn establish(&self, generation: u64, outbound: &mpsc::UnboundedSender<String>) -> Result<bool> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        if inner.generation != generation {
            return Ok(false);
        }

        let rooms = self.membership.replay_events()?;
        let room_count = rooms.len();

        let mut frames = Vec::with_capacity(room_count + 1 + inner.queue.len());
        for event in rooms {
            frames.push(event.to_frame()?);
        }
        frames.push(OutboundEvent::UserOnline.to_frame()?);
        for event in &inner.queue {
            frames.push(event.to_frame()?);
        }

        for frame in frames {
            outbound
                .send(frame)
                .map_err(|_| SyncError::ConnectionClosed)?;
        }

        let flushed = inner.queue.len();
        inner.queue.clear();
        inner.outbound = Some(outbound.clone());
        self.transition(inner, ConnectionState::Connected);
        info!(
            "Channel established, rejoined {} rooms, flushed {} queued events",
            room_count, flushed
        );
        Ok(true)
    }

    fn detach(&self, generation: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.generation != generation {
            return false;
        }

        inner.outbound = None;
        self.transition(&mut inner, ConnectionState::Reconnecting { attempt: 0 });
        true
    }

    fn enter_reconnecting(&self, generation: u64, attempt: u32) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.generation != generation {
            return false;
        }

        self.transition(&mut inner, ConnectionState::Reconnecting { attempt });
        true
    }

    async fn give_up_auth(&self, generation: u64) {
        if let Err(e) = self.credentials.clear().await {
            error!("Failed to clear rejected credentials: {}", e);
        }
        self.fail(generation, FailureReason::AuthRequired);
    }

    fn fail(&self, generation: u64, reason: FailureReason) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        if inner.generation != generation {
            return;
        }

        inner.outbound = None;
        inner.queue.clear();
        // This runs on the supervisor itself, dropping the handle detaches it
        inner.supervisor = None;
        self.transition(inner, ConnectionState::Failed(reason));
    }
}

impl EventEmitter for ConnectionManager {
    /// Sends now when connected, queues while (re)connecting, and refuses
    /// when disconnected or failed.
    fn emit(&self, event: OutboundEvent) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;

        match inner.state {
            ConnectionState::Connected => {
                let frame = event.to_frame()?;
                let sent = inner
                    .outbound
                    .as_ref()
                    .map(|tx| tx.send(frame).is_ok())
                    .unwrap_or(false);
                if !sent {
                    inner.queue.push_back(event);
                }
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                debug!("Queueing {} until the channel is up", event.name());
                inner.queue.push_back(event);
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => Err(SyncError::NotConnected),
        }
    }
}

async fn wait_settled(state_rx: &mut watch::Receiver<ConnectionState>) -> Result<()> {
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed(FailureReason::AuthRequired) => return Err(SyncError::AuthRequired),
            ConnectionState::Failed(FailureReason::RetriesExhausted) => {
                return Err(SyncError::TransientNetwork(
                    "reconnect attempts exhausted".to_string(),
                ))
            }
            ConnectionState::Disconnected => return Err(SyncError::NotConnected),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {}
        }

        state_rx
            .changed()
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;
    }
}

/// Thread-safe wrapper for ConnectionManager
pub type SharedConnection = Arc<ConnectionManager>;
