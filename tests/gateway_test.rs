mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use rusty_sync::core::message::IssueStatus;
use rusty_sync::error::SyncError;
use rusty_sync::gateway::client::Gateway;
use rusty_sync::gateway::endpoints::PageRequest;
use rusty_sync::gateway::http::{ApiRequest, ApiResponse};
use rusty_sync::storage::credentials::{Credentials, MemoryCredentialStore};
use rusty_sync::storage::traits::CredentialStore;

fn gateway(backend: Arc<MockBackend>, credentials: Option<Credentials>) -> (Gateway, Arc<MemoryCredentialStore>) {
    let store = Arc::new(match credentials {
        Some(c) => MemoryCredentialStore::with_credentials(c),
        None => MemoryCredentialStore::new(),
    });
    (Gateway::new(test_config(), backend, store.clone()), store)
}

fn initial() -> Credentials {
    Credentials::new("access-1", Some("refresh-1".to_string()))
}

/// Rejects `access-1`, accepts anything else, and hands out `access-2`
fn renewing_backend(delay: Duration) -> Arc<MockBackend> {
    MockBackend::new(move |request, token| {
        if request.path == "auth/refresh" {
            return Reply::ok(json!({
                "status": "success",
                "data": { "accessToken": "access-2", "refreshToken": "refresh-2" }
            }));
        }
        let status = if token == Some("access-1") { 401 } else { 200 };
        Reply::Delayed(
            delay,
            ApiResponse::new(status, json!({ "status": "success", "data": { "user": user("u9") } })),
        )
    })
}

#[tokio::test]
async fn test_expired_token_is_renewed_and_request_retried_once() {
    let backend = renewing_backend(Duration::ZERO);
    let (gateway, store) = gateway(backend.clone(), Some(initial()));

    let user = gateway.get_user("u9").await.unwrap();
    assert_eq!(user.id, "u9");

    let calls = backend.calls();
    let tokens: Vec<Option<String>> = calls.iter().map(|c| c.token.clone()).collect();
    assert_eq!(
        tokens,
        vec![Some("access-1".into()), None, Some("access-2".into())]
    );
    assert_eq!(calls[1].body, Some(json!({ "refreshToken": "refresh-1" })));

    let stored = store.load().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_401s_share_one_renewal() {
    let backend = renewing_backend(Duration::from_millis(50));
    let (gateway, _store) = gateway(backend.clone(), Some(initial()));

    let (a, b, c) = tokio::join!(
        gateway.get_user("u9"),
        gateway.get_user("u9"),
        gateway.get_user("u9")
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(backend.calls_to("auth/refresh"), 1);
    assert_eq!(backend.calls_to("users/u9"), 6);
}

#[tokio::test]
async fn test_failed_renewal_clears_credentials() {
    let backend = MockBackend::new(|request, _| {
        if request.path == "auth/refresh" {
            Reply::status(401, json!({ "message": "Invalid refresh token" }))
        } else {
            Reply::status(401, json!({ "message": "jwt expired" }))
        }
    });
    let (gateway, store) = gateway(backend.clone(), Some(initial()));

    assert_eq!(gateway.get_user("u9").await, Err(SyncError::AuthRequired));
    assert!(store.load().await.unwrap().is_none());
    assert_eq!(backend.calls_to("users/u9"), 1);
}

#[tokio::test]
async fn test_second_401_after_renewal_is_final() {
    let backend = MockBackend::new(|request, _| {
        if request.path == "auth/refresh" {
            Reply::ok(json!({ "accessToken": "access-2" }))
        } else {
            Reply::status(401, json!({ "message": "still no" }))
        }
    });
    let (gateway, _store) = gateway(backend.clone(), Some(initial()));

    assert_eq!(gateway.get_user("u9").await, Err(SyncError::AuthRequired));
    assert_eq!(backend.calls_to("users/u9"), 2);
    assert_eq!(backend.calls_to("auth/refresh"), 1);
}

#[tokio::test]
async fn test_login_goes_out_without_credential_and_is_not_renewed() {
    let backend = MockBackend::new(|_, _| Reply::status(401, json!({ "message": "Invalid credentials" })));
    let (gateway, _store) = gateway(backend.clone(), Some(initial()));

    let result = gateway.login("a@example.com", "wrong").await;

    assert_eq!(result.unwrap_err(), SyncError::AuthRequired);
    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "auth/login");
    assert!(calls[0].token.is_none());
}

#[tokio::test]
async fn test_login_returns_credentials() {
    let backend = MockBackend::new(|_, _| {
        Reply::ok(json!({
            "status": "success",
            "data": { "user": user("u1"), "accessToken": "a", "refreshToken": "r" }
        }))
    });
    let (gateway, _store) = gateway(backend, None);

    let login = gateway.login("a@example.com", "secret").await.unwrap();
    assert_eq!(login.user.id, "u1");
    assert_eq!(login.credentials.access_token, "a");
    assert_eq!(login.credentials.refresh_token.as_deref(), Some("r"));
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out() {
    let backend = MockBackend::new(|_, _| {
        Reply::Delayed(Duration::from_secs(11), ApiResponse::new(200, json!({})))
    });
    let (gateway, _store) = gateway(backend, Some(initial()));

    let started = tokio::time::Instant::now();
    assert_eq!(gateway.request(ApiRequest::get("posts")).await, Err(SyncError::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
}

#[tokio::test]
async fn test_rejection_message_is_surfaced() {
    let backend = MockBackend::new(|_, _| {
        Reply::status(422, json!({ "status": "fail", "message": "Label already exists" }))
    });
    let (gateway, _store) = gateway(backend, Some(initial()));

    assert_eq!(
        gateway.add_issue_label("i1", "bug").await,
        Err(SyncError::ValidationRejected {
            status: 422,
            message: "Label already exists".into()
        })
    );
}

#[tokio::test]
async fn test_paginated_listing() {
    let backend = MockBackend::new(|request, _| {
        assert_eq!(
            request.query,
            vec![("page".to_string(), "2".to_string()), ("limit".to_string(), "5".to_string())]
        );
        Reply::ok(json!({
            "status": "success",
            "data": { "posts": [post("p1", &[])], "total": 6, "page": 2, "totalPages": 2, "hasMore": false }
        }))
    });
    let (gateway, _store) = gateway(backend, Some(initial()));

    let page = gateway.list_posts(PageRequest::new(2, 5)).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.page, 2);
    assert!(!page.has_more());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let backend = MockBackend::new(|_, _| Reply::status(503, json!({ "message": "maintenance" })));
    let (gateway, _store) = gateway(backend.clone(), Some(initial()));

    let result = gateway.get_post("p1").await;
    assert!(result.unwrap_err().is_transient());
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_ids_are_encoded_in_paths() {
    let backend = MockBackend::new(|_, _| {
        Reply::ok(json!({ "status": "success", "data": { "issue": issue("i/1", IssueStatus::Open) } }))
    });
    let (gateway, _store) = gateway(backend.clone(), Some(initial()));

    gateway.unassign_issue("i/1", "user 2").await.unwrap();

    assert_eq!(backend.calls()[0].path, "issues/i%2F1/assign/user%202");
}
