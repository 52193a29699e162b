mod common;

use common::*;
use roomlink::envelope::{Envelope, PresenceStatus};
use roomlink::PresenceTracker;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_remote_typing_expires_after_ttl() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let tracker = PresenceTracker::new(connection.clone(), test_presence_config());
    let mut typing = connection.events().typing.subscribe();

    server
        .inject(&Envelope::TypingStart {
            room_id: "room-1".into(),
            user_id: Some("alice".into()),
        })
        .await;

    let started = timeout(Duration::from_secs(1), typing.recv()).await.unwrap().unwrap();
    assert!(started.is_typing);
    assert_eq!(started.user_id, "alice");
    assert_eq!(tracker.typing_users(&"room-1".to_string()), vec!["alice".to_string()]);

    // No stop ever arrives; the TTL sweep clears the indicator.
    let stopped = timeout(Duration::from_secs(1), typing.recv()).await.unwrap().unwrap();
    assert!(!stopped.is_typing);
    assert_eq!(stopped.user_id, "alice");
    assert!(tracker.typing_users(&"room-1".to_string()).is_empty());
    connection.disconnect().await;
}

#[tokio::test]
async fn test_typing_stop_clears_immediately() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let tracker = PresenceTracker::new(connection.clone(), test_presence_config());
    let mut typing = connection.events().typing.subscribe();

    server
        .inject(&Envelope::TypingStart {
            room_id: "room-1".into(),
            user_id: Some("alice".into()),
        })
        .await;
    timeout(Duration::from_secs(1), typing.recv()).await.unwrap().unwrap();

    server
        .inject(&Envelope::TypingStop {
            room_id: "room-1".into(),
            user_id: Some("alice".into()),
        })
        .await;
    let stopped = timeout(Duration::from_secs(1), typing.recv()).await.unwrap().unwrap();
    assert!(!stopped.is_typing);
    assert!(tracker.typing_users(&"room-1".to_string()).is_empty());
    connection.disconnect().await;
}

#[tokio::test]
async fn test_typing_without_sender_attribution_is_dropped() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let _tracker = PresenceTracker::new(connection.clone(), test_presence_config());
    let mut typing = connection.events().typing.subscribe();

    server
        .inject(&Envelope::TypingStart {
            room_id: "room-1".into(),
            user_id: None,
        })
        .await;
    sleep(Duration::from_millis(50)).await;
    assert!(typing.try_recv().is_err());
    connection.disconnect().await;
}

#[tokio::test]
async fn test_local_typing_starts_are_throttled() {
    let (connection, _factory, _server_ends, mut server) = connected_client().await;
    let tracker = PresenceTracker::new(connection.clone(), test_presence_config());

    // Rapid keystrokes: only the first start goes out inside the window.
    tracker.set_local_typing("room-1".to_string(), true).await;
    tracker.set_local_typing("room-1".to_string(), true).await;
    tracker.set_local_typing("room-1".to_string(), true).await;
    assert!(matches!(
        server.next_non_heartbeat().await,
        Envelope::TypingStart { .. }
    ));
    server.assert_no_frame(Duration::from_millis(40)).await;

    // Past the throttle window the next start goes out again.
    sleep(Duration::from_millis(100)).await;
    tracker.set_local_typing("room-1".to_string(), true).await;
    assert!(matches!(
        server.next_non_heartbeat().await,
        Envelope::TypingStart { .. }
    ));

    // Stops always go out immediately.
    tracker.set_local_typing("room-1".to_string(), false).await;
    assert!(matches!(
        server.next_non_heartbeat().await,
        Envelope::TypingStop { .. }
    ));
    connection.disconnect().await;
}

#[tokio::test]
async fn test_presence_lookup_follows_updates() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let tracker = PresenceTracker::new(connection.clone(), test_presence_config());
    let mut presence = connection.events().presence.subscribe();

    server
        .inject(&Envelope::PresenceUpdate {
            user_id: "carol".into(),
            status: PresenceStatus::Online,
        })
        .await;
    let event = timeout(Duration::from_secs(1), presence.recv()).await.unwrap().unwrap();
    assert!(event.online);
    assert!(tracker.is_user_online(&"carol".to_string()));

    server
        .inject(&Envelope::PresenceUpdate {
            user_id: "carol".into(),
            status: PresenceStatus::Offline,
        })
        .await;
    let event = timeout(Duration::from_secs(1), presence.recv()).await.unwrap().unwrap();
    assert!(!event.online);
    assert!(!tracker.is_user_online(&"carol".to_string()));
    // Unknown users are simply offline.
    assert!(!tracker.is_user_online(&"mallory".to_string()));
    connection.disconnect().await;
}
