#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use rusty_sync::config::ClientConfig;
use rusty_sync::core::connection::{ConnectionState, Connector, Link, LinkPeer};
use rusty_sync::core::message::{ChatMessage, Issue, IssueStatus, Notification, Post, UserRef};
use rusty_sync::core::session::SyncSession;
use rusty_sync::error::{Result, SyncError};
use rusty_sync::gateway::http::{ApiRequest, ApiResponse, HttpBackend, Method};
use rusty_sync::storage::credentials::{Credentials, MemoryCredentialStore};

pub const SELF_ID: &str = "user-1";

/// Mint an access token for `sub`
pub fn token_for(sub: &str, nonce: u32) -> String {
    let claims = json!({
        "sub": sub,
        "exp": 4_102_444_800i64,
        "iat": 1_700_000_000i64,
        "nonce": nonce,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::with_api_url("http://localhost:3000/api/v1").unwrap();
    config.reconnect.jitter = 0.0;
    config
}

// HTTP backend

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub token: Option<String>,
    pub body: Option<Value>,
}

pub enum Reply {
    Respond(ApiResponse),
    Delayed(Duration, ApiResponse),
    Fail(SyncError),
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Respond(ApiResponse::new(200, body))
    }

    pub fn status(status: u16, body: Value) -> Self {
        Reply::Respond(ApiResponse::new(status, body))
    }
}

type Route = Box<dyn Fn(&ApiRequest, Option<&str>) -> Reply + Send + Sync>;

/// Answers requests through a routing closure and records every call
pub struct MockBackend {
    route: Route,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockBackend {
    pub fn new<F>(route: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest, Option<&str>) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            route: Box::new(route),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Backend answering every request with an empty 200
    pub fn accepting() -> Arc<Self> {
        Self::new(|_, _| Reply::ok(json!({ "status": "success" })))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }
}

#[async_trait]
impl HttpBackend for MockBackend {
    async fn send(&self, _url: Url, request: &ApiRequest, access_token: Option<&str>) -> Result<ApiResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            token: access_token.map(str::to_string),
            body: request.body.clone(),
        });

        match (self.route)(request, access_token) {
            Reply::Respond(response) => Ok(response),
            Reply::Delayed(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Reply::Fail(err) => Err(err),
        }
    }
}

// Channel connector

/// Opens in-memory links. Each open consumes the next scripted outcome;
/// once the script is empty every open succeeds.
pub struct MockConnector {
    script: Mutex<VecDeque<SyncError>>,
    opens: Mutex<Vec<(String, Instant)>>,
    peers_tx: mpsc::UnboundedSender<LinkPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkPeer>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        })
    }

    /// Make the next opens fail with `errors`, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.script.lock().unwrap().extend(errors);
    }

    /// Wait for the next successfully opened link
    pub async fn next_peer(&self) -> LinkPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _url: &Url, access_token: &str) -> Result<Link> {
        self.opens
            .lock()
            .unwrap()
            .push((access_token.to_string(), Instant::now()));

        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }

        let (link, peer) = Link::pair();
        let _ = self.peers_tx.send(peer);
        Ok(link)
    }
}

/// Event names and payloads sent so far on a link
pub fn drain_sent(peer: &mut LinkPeer) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = peer.sent.try_recv() {
        frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
}

pub fn event_names(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| f["event"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub async fn wait_for_state<F>(rx: &mut watch::Receiver<ConnectionState>, predicate: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    loop {
        let state = *rx.borrow_and_update();
        if predicate(&state) {
            return state;
        }
        rx.changed().await.expect("state channel closed");
    }
}

// Sessions

pub struct Harness {
    pub session: SyncSession,
    pub backend: Arc<MockBackend>,
    pub connector: Arc<MockConnector>,
    pub store: Arc<MemoryCredentialStore>,
}

pub fn harness(backend: Arc<MockBackend>, credentials: Option<Credentials>) -> Harness {
    let connector = MockConnector::new();
    let store = Arc::new(match credentials {
        Some(credentials) => MemoryCredentialStore::with_credentials(credentials),
        None => MemoryCredentialStore::new(),
    });

    let session = SyncSession::builder(test_config())
        .backend(backend.clone())
        .connector(connector.clone())
        .credential_store(store.clone())
        .build()
        .unwrap();

    Harness {
        session,
        backend,
        connector,
        store,
    }
}

pub fn logged_in(backend: Arc<MockBackend>) -> Harness {
    harness(
        backend,
        Some(Credentials::new(token_for(SELF_ID, 1), Some("refresh-1".to_string()))),
    )
}

// Fixtures

pub fn user(id: &str) -> UserRef {
    UserRef {
        id: id.to_string(),
        username: format!("{}-name", id),
        profile: None,
    }
}

fn at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn post(id: &str, likes: &[&str]) -> Post {
    Post {
        id: id.to_string(),
        author: user("author"),
        title: format!("Post {}", id),
        content: "content".to_string(),
        tags: vec![],
        likes: likes.iter().map(|s| s.to_string()).collect(),
        bookmarks: vec![],
        comment_count: 0,
        view_count: 0,
        created_at: at(),
        updated_at: at(),
    }
}

pub fn issue(id: &str, status: IssueStatus) -> Issue {
    Issue {
        id: id.to_string(),
        creator: user("author"),
        title: format!("Issue {}", id),
        description: String::new(),
        status,
        priority: None,
        labels: vec![],
        assignees: vec![],
        comment_count: 0,
        created_at: at(),
        updated_at: at(),
        closed_at: None,
    }
}

pub fn message(id: &str, chat_id: &str, sender: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        chat: chat_id.to_string(),
        sender: user(sender),
        content: format!("message {}", id),
        read_by: vec![sender.to_string()],
        created_at: at(),
    }
}

pub fn notification(id: &str) -> Notification {
    Notification {
        id: id.to_string(),
        recipient: SELF_ID.to_string(),
        kind: "like".to_string(),
        actor: user("author"),
        resource: None,
        message: format!("notification {}", id),
        is_read: false,
        created_at: at(),
    }
}
