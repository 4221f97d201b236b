mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusty_sync::core::connection::{ConnectionState, FailureReason};
use rusty_sync::core::message_types::{EventKind, InboundEvent};
use rusty_sync::core::room::Room;
use rusty_sync::error::SyncError;
use rusty_sync::storage::traits::CredentialStore;

#[tokio::test]
async fn test_connect_without_credentials_requires_auth() {
    let h = harness(MockBackend::accepting(), None);

    assert_eq!(h.session.connect().await, Err(SyncError::AuthRequired));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.connector.open_count(), 0);
}

#[tokio::test]
async fn test_emit_while_disconnected_is_refused() {
    let h = logged_in(MockBackend::accepting());

    assert_eq!(
        h.session.send_message("C", "hello"),
        Err(SyncError::NotConnected)
    );
}

#[tokio::test]
async fn test_connect_joins_user_room_and_announces_presence() {
    let h = logged_in(MockBackend::accepting());
    h.session.open_chat("C").unwrap();

    h.session.connect().await.unwrap();
    let mut peer = h.connector.next_peer().await;

    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.session.self_id().as_deref(), Some(SELF_ID));

    let frames = drain_sent(&mut peer);
    assert_eq!(
        frames,
        vec![
            json!({ "event": "join_room", "data": { "room": "user:user-1" } }),
            json!({ "event": "join_chat", "data": { "chatId": "C" } }),
            json!({ "event": "user_online" }),
        ]
    );
}

#[tokio::test]
async fn test_join_while_connected_is_sent_immediately_and_once() {
    let h = logged_in(MockBackend::accepting());
    h.session.connect().await.unwrap();
    let mut peer = h.connector.next_peer().await;
    drain_sent(&mut peer);

    assert!(h.session.open_chat("C").unwrap());
    assert!(!h.session.open_chat("C").unwrap());
    assert!(h.session.close_chat("C").unwrap());
    assert!(!h.session.close_chat("C").unwrap());

    assert_eq!(
        event_names(&drain_sent(&mut peer)),
        vec!["join_chat", "leave_chat"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backs_off_and_restores_membership() {
    let h = logged_in(MockBackend::accepting());
    let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = received.clone();
    h.session
        .subscribe_fn(EventKind::Notification, move |event| {
            if let InboundEvent::Notification(n) = event {
                sink.lock().unwrap().push(n.id.clone());
            }
            Ok(())
        })
        .unwrap();
    let handlers_before = h.session.router().handler_count(EventKind::Notification);

    h.session.open_chat("C").unwrap();
    h.session.connect().await.unwrap();
    let first = h.connector.next_peer().await;

    // Two failed attempts, the third one succeeds
    h.connector.fail_next([
        SyncError::TransientNetwork("refused".into()),
        SyncError::TransientNetwork("refused".into()),
    ]);
    let mut states = h.session.subscribe_state();
    drop(first);

    wait_for_state(&mut states, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    let mut peer = h.connector.next_peer().await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;

    assert_eq!(h.connector.open_count(), 4);
    let opens = h.connector.open_times();
    let gaps: Vec<Duration> = opens.windows(2).skip(1).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 2);
    for (gap, expected) in gaps.iter().zip([Duration::from_secs(2), Duration::from_secs(4)]) {
        assert!(*gap >= expected && *gap < expected + Duration::from_millis(10), "gap {:?}", gap);
    }

    let frames = drain_sent(&mut peer);
    assert_eq!(
        event_names(&frames),
        vec!["join_room", "join_chat", "user_online"]
    );
    assert_eq!(frames[0]["data"]["room"], "user:user-1");
    assert_eq!(frames[1]["data"]["chatId"], "C");

    // Registrations carried over without duplicates
    assert_eq!(
        h.session.router().handler_count(EventKind::Notification),
        handlers_before
    );
    peer.push
        .send(json!({ "event": "notification", "data": notification("n1") }).to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*received.lock().unwrap(), vec!["n1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let h = logged_in(MockBackend::accepting());
    h.session.connect().await.unwrap();
    let first = h.connector.next_peer().await;

    h.connector
        .fail_next((0..10).map(|_| SyncError::TransientNetwork("down".into())));
    let mut states = h.session.subscribe_state();
    drop(first);

    let state = wait_for_state(&mut states, ConnectionState::is_failed).await;
    assert_eq!(state, ConnectionState::Failed(FailureReason::RetriesExhausted));
    // Initial open plus five reconnect attempts
    assert_eq!(h.connector.open_count(), 6);
    // Credentials survive a network failure
    assert!(h.store.load().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_events_emitted_while_reconnecting_are_flushed_after_replay() {
    let h = logged_in(MockBackend::accepting());
    h.session.connect().await.unwrap();
    let first = h.connector.next_peer().await;

    h.connector
        .fail_next([SyncError::TransientNetwork("refused".into())]);
    let mut states = h.session.subscribe_state();
    drop(first);
    wait_for_state(&mut states, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

    h.session.send_message("C", "queued").unwrap();
    assert_eq!(h.session.connection().queued(), 1);

    let mut peer = h.connector.next_peer().await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;

    let frames = drain_sent(&mut peer);
    assert_eq!(
        event_names(&frames),
        vec!["join_room", "user_online", "send_message"]
    );
    assert_eq!(frames[2]["data"], json!({ "chatId": "C", "content": "queued" }));
}

#[tokio::test]
async fn test_channel_auth_failure_clears_credentials() {
    let backend = MockBackend::new(|request, _| {
        if request.path == "auth/refresh" {
            Reply::status(401, json!({ "message": "Refresh token expired" }))
        } else {
            Reply::ok(json!({ "status": "success" }))
        }
    });
    let h = logged_in(backend);
    h.connector
        .fail_next([SyncError::Unauthorized("jwt expired".into())]);

    let result = h.session.connect().await;

    assert_eq!(result, Err(SyncError::AuthRequired));
    assert_eq!(
        h.session.state(),
        ConnectionState::Failed(FailureReason::AuthRequired)
    );
    assert!(h.store.load().await.unwrap().is_none());
    assert_eq!(h.backend.calls_to("auth/refresh"), 1);
    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test]
async fn test_channel_auth_failure_renews_once_and_reconnects() {
    let backend = MockBackend::new(|request, _| {
        if request.path == "auth/refresh" {
            Reply::ok(json!({
                "status": "success",
                "data": { "accessToken": token_for(SELF_ID, 2), "refreshToken": "refresh-2" }
            }))
        } else {
            Reply::ok(json!({ "status": "success" }))
        }
    });
    let h = logged_in(backend);
    h.connector
        .fail_next([SyncError::Unauthorized("jwt expired".into())]);

    h.session.connect().await.unwrap();

    let tokens = h.connector.tokens();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
    assert_eq!(tokens[1], token_for(SELF_ID, 2));
    let stored = h.store.load().await.unwrap().unwrap();
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn test_server_auth_error_frame_triggers_renewal() {
    let backend = MockBackend::new(|request, _| {
        if request.path == "auth/refresh" {
            Reply::ok(json!({ "accessToken": token_for(SELF_ID, 3) }))
        } else {
            Reply::ok(json!({ "status": "success" }))
        }
    });
    let h = logged_in(backend);
    h.session.connect().await.unwrap();
    let first = h.connector.next_peer().await;
    let mut states = h.session.subscribe_state();

    first
        .push
        .send(json!({ "event": "connect_error", "data": { "message": "Authentication error" } }).to_string())
        .unwrap();

    let _second = h.connector.next_peer().await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;
    assert_eq!(h.backend.calls_to("auth/refresh"), 1);
    assert_eq!(h.connector.tokens()[1], token_for(SELF_ID, 3));
}

#[tokio::test]
async fn test_expiry_after_renewed_reconnect_gets_its_own_renewal() {
    let issued = Arc::new(AtomicU32::new(1));
    let counter = issued.clone();
    let backend = MockBackend::new(move |request, _| {
        if request.path == "auth/refresh" {
            let nonce = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Reply::ok(json!({ "accessToken": token_for(SELF_ID, nonce) }))
        } else {
            Reply::ok(json!({ "status": "success" }))
        }
    });
    let h = logged_in(backend);
    h.connector
        .fail_next([SyncError::Unauthorized("jwt expired".into())]);

    h.session.connect().await.unwrap();
    let first = h.connector.next_peer().await;
    let mut states = h.session.subscribe_state();

    first
        .push
        .send(json!({ "event": "connect_error", "data": { "message": "Authentication error: jwt expired" } }).to_string())
        .unwrap();

    let _second = h.connector.next_peer().await;
    wait_for_state(&mut states, ConnectionState::is_connected).await;

    assert_eq!(h.backend.calls_to("auth/refresh"), 2);
    assert!(h.store.load().await.unwrap().is_some());
    let tokens = h.connector.tokens();
    assert_eq!(tokens.len(), 3);
    assert_eq!(tokens[2], token_for(SELF_ID, 3));
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_keeps_membership() {
    let h = logged_in(MockBackend::accepting());
    h.session.open_chat("C").unwrap();
    h.session.connect().await.unwrap();
    let mut peer = h.connector.next_peer().await;
    drain_sent(&mut peer);

    h.session.disconnect().unwrap();
    h.session.disconnect().unwrap();

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(event_names(&drain_sent(&mut peer)), vec!["user_offline"]);
    assert!(h.session.membership().contains(&Room::chat("C")).unwrap());
    assert_eq!(h.session.send_message("C", "hi"), Err(SyncError::NotConnected));

    // Reconnecting restores the prior subscriptions
    h.session.connect().await.unwrap();
    let mut peer = h.connector.next_peer().await;
    assert_eq!(
        event_names(&drain_sent(&mut peer)),
        vec!["join_room", "join_chat", "user_online"]
    );
}

#[tokio::test]
async fn test_logout_clears_session_state() {
    let h = logged_in(MockBackend::accepting());
    h.session.connect().await.unwrap();
    let _peer = h.connector.next_peer().await;
    h.session
        .router()
        .dispatch(&InboundEvent::Notification(notification("n1")));

    h.session.logout().await.unwrap();

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert!(h.store.load().await.unwrap().is_none());
    assert!(h.session.cache().is_empty());
    assert!(h.session.membership().is_empty());
    assert!(h.session.self_id().is_none());
    assert_eq!(h.backend.calls_to("auth/logout"), 1);
}
