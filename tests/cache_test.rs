mod common;

use common::*;
use rusty_sync::core::message::{Entity, EntityKey};
use rusty_sync::core::message_types::{InboundEvent, PresencePayload, TypingPayload};
use rusty_sync::storage::cache::{CacheTarget, CollectionKey};

#[tokio::test]
async fn test_duplicate_new_message_is_applied_once() {
    let h = logged_in(MockBackend::accepting());
    let router = h.session.router();

    let first = router.dispatch(&InboundEvent::NewMessage(message("m1", "C", "user-2")));
    let second = router.dispatch(&InboundEvent::NewMessage(message("m1", "C", "user-2")));

    assert_eq!(first.failed, 0);
    assert_eq!(second.failed, 0);

    let messages = h.session.cache().messages("C");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");
}

#[tokio::test]
async fn test_repeated_duplicates_keep_one_entry_per_id() {
    let h = logged_in(MockBackend::accepting());
    let router = h.session.router();

    for id in ["m1", "m2", "m1", "m3", "m2", "m1"] {
        router.dispatch(&InboundEvent::NewMessage(message(id, "C", "user-2")));
    }

    let ids: Vec<String> = h.session.cache().messages("C").into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn test_new_message_updates_chat_preview() {
    let h = logged_in(MockBackend::accepting());
    let cache = h.session.cache();
    cache
        .set_collection(
            CollectionKey::Chats,
            vec![Entity::Chat(rusty_sync::core::message::Chat {
                id: "C".into(),
                kind: "direct".into(),
                name: None,
                participants: vec![user(SELF_ID), user("user-2")],
                last_message: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })],
            1,
            1,
        )
        .unwrap();

    let incoming = message("m9", "C", "user-2");
    h.session
        .router()
        .dispatch(&InboundEvent::NewMessage(incoming.clone()));

    let chat = cache.chat("C").unwrap();
    let preview = chat.last_message.unwrap();
    assert_eq!(preview.id, "m9");
    assert_eq!(chat.updated_at, incoming.created_at);
}

#[tokio::test]
async fn test_pushed_message_for_unfetched_chat_marks_log_stale() {
    let h = logged_in(MockBackend::accepting());
    h.session
        .router()
        .dispatch(&InboundEvent::NewMessage(message("m1", "D", "user-2")));

    assert!(h
        .session
        .cache()
        .is_stale(&CacheTarget::Collection(CollectionKey::ChatMessages("D".into()))));
}

#[tokio::test]
async fn test_duplicate_notification_is_dropped() {
    let h = logged_in(MockBackend::accepting());
    let router = h.session.router();

    router.dispatch(&InboundEvent::Notification(notification("n1")));
    router.dispatch(&InboundEvent::Notification(notification("n2")));
    router.dispatch(&InboundEvent::Notification(notification("n1")));

    let ids: Vec<String> = h
        .session
        .cache()
        .notifications()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ids, vec!["n2", "n1"]);
    assert_eq!(h.session.cache().unread_notifications(), 2);
}

#[tokio::test]
async fn test_new_message_clears_sender_typing() {
    let h = logged_in(MockBackend::accepting());
    let router = h.session.router();

    router.dispatch(&InboundEvent::UserTyping(TypingPayload {
        user_id: "user-2".into(),
        chat_id: "C".into(),
    }));
    assert_eq!(h.session.typing().typing_users("C"), vec!["user-2"]);

    router.dispatch(&InboundEvent::NewMessage(message("m1", "C", "user-2")));
    assert!(h.session.typing().typing_users("C").is_empty());
}

#[tokio::test]
async fn test_presence_events_update_presence_set() {
    let h = logged_in(MockBackend::accepting());
    let router = h.session.router();

    router.dispatch(&InboundEvent::UserOnline(PresencePayload { user_id: "a".into() }));
    router.dispatch(&InboundEvent::UserOnline(PresencePayload { user_id: "b".into() }));
    router.dispatch(&InboundEvent::UserOffline(PresencePayload { user_id: "a".into() }));

    assert_eq!(h.session.presence().online_users(), vec!["b"]);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_cache() {
    let h = logged_in(MockBackend::accepting());
    h.session
        .subscribe_fn(rusty_sync::core::message_types::EventKind::NewMessage, |_| {
            panic!("subscriber bug")
        })
        .unwrap();

    let report = h
        .session
        .router()
        .dispatch(&InboundEvent::NewMessage(message("m1", "C", "user-2")));

    assert_eq!(report.failed, 1);
    assert!(h.session.cache().contains(&EntityKey::message("m1")));
}
