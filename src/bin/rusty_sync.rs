use log::{error, info, warn};
use std::env;

use rusty_sync::config::ClientConfig;
use rusty_sync::core::message_types::{EventKind, InboundEvent};
use rusty_sync::core::session::SyncSession;
use rusty_sync::error::{Result, SyncError};
use rusty_sync::storage::credentials::Credentials;
use rusty_sync::storage::traits::CredentialStore;

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    if let Err(e) = run().await {
        error!("rusty_sync stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = ClientConfig::from_env()?;
    info!("Configuration: api={}, socket={}", config.api_url, config.socket_url);

    let session = SyncSession::builder(config).build()?;
    authenticate(&session).await?;

    for kind in EventKind::ALL {
        session.subscribe_fn(kind, log_event)?;
    }

    let mut states = session.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!("Channel is {}", state);
        }
    });

    session.connect().await?;
    info!(
        "Connected as {}",
        session.self_id().unwrap_or_else(|| "<unknown>".to_string())
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    session.disconnect()
}

/// Use stored credentials, or log in from the environment
async fn authenticate(session: &SyncSession) -> Result<()> {
    if session.gateway().credentials().load().await?.is_some() {
        info!("Using stored credentials");
        return Ok(());
    }

    if let (Ok(email), Ok(password)) = (env::var("RUSTY_SYNC_EMAIL"), env::var("RUSTY_SYNC_PASSWORD")) {
        let user = session.login(&email, &password).await?;
        info!("Logged in as {}", user.username);
        return Ok(());
    }

    if let Ok(access_token) = env::var("RUSTY_SYNC_ACCESS_TOKEN") {
        let refresh_token = env::var("RUSTY_SYNC_REFRESH_TOKEN").ok();
        return session
            .login_with(Credentials::new(access_token, refresh_token))
            .await;
    }

    Err(SyncError::AuthRequired)
}

fn log_event(event: &InboundEvent) -> Result<()> {
    match event {
        InboundEvent::NewMessage(message) => info!(
            "[{}] {}: {}",
            message.chat, message.sender.username, message.content
        ),
        InboundEvent::Notification(notification) => info!("Notification: {}", notification.message),
        InboundEvent::UserOnline(p) => info!("{} is online", p.user_id),
        InboundEvent::UserOffline(p) => info!("{} is offline", p.user_id),
        InboundEvent::UserTyping(t) => info!("{} is typing in {}", t.user_id, t.chat_id),
        InboundEvent::UserStopTyping(t) => info!("{} stopped typing in {}", t.user_id, t.chat_id),
    }
    Ok(())
}
