mod common;

use common::*;
use roomlink::envelope::{Envelope, IdempotencyKey};
use roomlink::RoomMessenger;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_send_then_ack_clears_pending() {
    let (connection, _factory, _server_ends, mut server) = connected_client().await;
    let messenger = RoomMessenger::new(connection.clone(), test_messenger_config());
    let mut acks = connection.events().message_ack.subscribe();

    let key = messenger
        .send_message("room-1".to_string(), "hello")
        .await
        .unwrap();
    match server.next_non_heartbeat().await {
        Envelope::ChatMessage {
            idempotency_key,
            content,
            ..
        } => {
            assert_eq!(idempotency_key, key);
            assert_eq!(content, "hello");
        }
        other => panic!("expected chat message, got {other:?}"),
    }
    assert_eq!(messenger.pending_count().await, 1);

    server
        .inject(&Envelope::ChatMessageAck {
            idempotency_key: key.clone(),
            server_seq: 42,
        })
        .await;

    let ack = timeout(Duration::from_secs(1), acks.recv())
        .await
        .expect("expected an ack event")
        .unwrap();
    assert_eq!(ack.idempotency_key, key);
    assert_eq!(ack.server_seq, 42);
    assert_eq!(messenger.pending_count().await, 0);
    connection.disconnect().await;
}

#[tokio::test]
async fn test_inbound_duplicates_delivered_once() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let _messenger = RoomMessenger::new(connection.clone(), test_messenger_config());
    let mut messages = connection.events().message.subscribe();

    let envelope = Envelope::ChatMessage {
        room_id: "room-1".into(),
        idempotency_key: IdempotencyKey::new("dup-1"),
        content: "once only".into(),
        sender_id: Some("bob".into()),
        server_seq: Some(9),
    };
    server.inject(&envelope).await;
    server.inject(&envelope).await;

    let delivered = timeout(Duration::from_secs(1), messages.recv())
        .await
        .expect("first copy must be delivered")
        .unwrap();
    assert_eq!(delivered.content, "once only");
    assert_eq!(delivered.sender_id.as_deref(), Some("bob"));

    // The duplicate is swallowed.
    assert!(
        timeout(Duration::from_millis(150), messages.recv())
            .await
            .is_err()
    );
    connection.disconnect().await;
}

#[tokio::test]
async fn test_unacked_messages_resent_in_order_after_reconnect() {
    let (connection, _factory, mut server_ends, mut server) = connected_client().await;
    let messenger = RoomMessenger::new(connection.clone(), test_messenger_config());

    let mut keys = Vec::new();
    for i in 0..3 {
        let key = messenger
            .send_message("room-1".to_string(), format!("m{i}"))
            .await
            .unwrap();
        server.next_non_heartbeat().await;
        keys.push(key);
    }
    assert_eq!(messenger.pending_count().await, 3);

    server.drop_connection().await;
    let mut server = next_server_end(&mut server_ends).await;

    for expected in &keys {
        match server.next_non_heartbeat().await {
            Envelope::ChatMessage {
                idempotency_key, ..
            } => assert_eq!(&idempotency_key, expected),
            other => panic!("expected a resent chat message, got {other:?}"),
        }
    }
    connection.disconnect().await;
}

#[tokio::test]
async fn test_pending_cap_rejects_further_sends() {
    let (connection, _factory, _server_ends, mut server) = connected_client().await;
    // max_pending is 3 in the test config.
    let messenger = RoomMessenger::new(connection.clone(), test_messenger_config());

    for _ in 0..3 {
        messenger
            .send_message("room-1".to_string(), "backlog")
            .await
            .unwrap();
        server.next_non_heartbeat().await;
    }
    let result = messenger.send_message("room-1".to_string(), "one too many").await;
    assert!(result.is_err());
    assert_eq!(messenger.pending_count().await, 3);
    connection.disconnect().await;
}

#[tokio::test]
async fn test_ack_for_unknown_key_is_ignored() {
    let (connection, _factory, _server_ends, server) = connected_client().await;
    let messenger = RoomMessenger::new(connection.clone(), test_messenger_config());
    let mut acks = connection.events().message_ack.subscribe();

    server
        .inject(&Envelope::ChatMessageAck {
            idempotency_key: IdempotencyKey::new("never-sent"),
            server_seq: 1,
        })
        .await;
    sleep(Duration::from_millis(50)).await;

    assert!(acks.try_recv().is_err());
    assert_eq!(messenger.pending_count().await, 0);
    connection.disconnect().await;
}
