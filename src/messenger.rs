//! Ordered, de-duplicated chat message dispatch with resend-on-reconnect.

use crate::config::MessengerConfig;
use crate::connection::{ConnectionState, TransportConnection};
use crate::envelope::{Envelope, IdempotencyKey, RoomId};
use crate::error::RateLimitError;
use crate::events::{DeliveredMessage, MessageAck};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, broadcast};

/// An outbound message we have not seen an ack for. Held in send order so
/// a reconnect replays the backlog exactly as the user wrote it.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub idempotency_key: IdempotencyKey,
    pub room_id: RoomId,
    pub content: String,
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

/// Bounded set of recently delivered idempotency keys. Insertion evicts
/// the oldest key once full.
struct SeenKeys {
    set: HashSet<IdempotencyKey>,
    order: VecDeque<IdempotencyKey>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: IdempotencyKey) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Chat message dispatch on top of the shared connection.
///
/// Sends are optimistic: the envelope goes out (or into the offline queue)
/// immediately and stays pending until the server acks its idempotency
/// key. On every reconnect the pending backlog is resent in original send
/// order. Inbound duplicates are dropped against the recent-key cache, so
/// listeners see each message exactly once.
pub struct RoomMessenger {
    connection: Arc<TransportConnection>,
    config: MessengerConfig,
    pending: Mutex<VecDeque<PendingMessage>>,
    seen: Mutex<SeenKeys>,
    shutdown: Notify,
}

impl RoomMessenger {
    pub fn new(connection: Arc<TransportConnection>, config: MessengerConfig) -> Arc<Self> {
        let seen_capacity = config.dedup_cache_size;
        let messenger = Arc::new(Self {
            connection,
            config,
            pending: Mutex::new(VecDeque::new()),
            seen: Mutex::new(SeenKeys::new(seen_capacity)),
            shutdown: Notify::new(),
        });
        // Subscribe before spawning so no envelope can slip past between
        // construction and the first poll of the loop.
        let inbound = messenger.connection.events().inbound.subscribe();
        let states = messenger.connection.events().connection_state.subscribe();
        let task = messenger.clone();
        tokio::spawn(async move { task.run(inbound, states).await });
        messenger
    }

    async fn run(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<Arc<Envelope>>,
        mut states: broadcast::Receiver<ConnectionState>,
    ) {
        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Ok(envelope) => self.handle_envelope(&envelope).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Messenger", "Inbound stream lagged by {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                state = states.recv() => {
                    if let Ok(ConnectionState::Connected) = state {
                        self.resend_pending().await;
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!(target: "Messenger", "Shutdown signaled, exiting messenger loop");
                    return;
                }
            }
        }
    }

    async fn handle_envelope(&self, envelope: &Envelope) {
        match envelope {
            Envelope::ChatMessage {
                room_id,
                idempotency_key,
                content,
                sender_id,
                server_seq,
            } => {
                let fresh = self.seen.lock().await.insert(idempotency_key.clone());
                if !fresh {
                    debug!(
                        target: "Messenger",
                        "Dropping duplicate message {idempotency_key}"
                    );
                    return;
                }
                let _ = self
                    .connection
                    .events()
                    .message
                    .send(Arc::new(DeliveredMessage {
                        room_id: room_id.clone(),
                        idempotency_key: idempotency_key.clone(),
                        content: content.clone(),
                        sender_id: sender_id.clone(),
                        server_seq: *server_seq,
                    }));
            }
            Envelope::ChatMessageAck {
                idempotency_key,
                server_seq,
            } => {
                let mut pending = self.pending.lock().await;
                let before = pending.len();
                pending.retain(|m| &m.idempotency_key != idempotency_key);
                if pending.len() == before {
                    debug!(
                        target: "Messenger",
                        "Ack for unknown key {idempotency_key}, ignoring"
                    );
                    return;
                }
                drop(pending);
                let _ = self.connection.events().message_ack.send(Arc::new(MessageAck {
                    idempotency_key: idempotency_key.clone(),
                    server_seq: *server_seq,
                }));
            }
            _ => {}
        }
    }

    /// Sends a chat message, returning the idempotency key callers can use
    /// to correlate the ack. Fails only when the unacked backlog hits the
    /// configured cap.
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: impl Into<String>,
    ) -> Result<IdempotencyKey, RateLimitError> {
        let content = content.into();
        let key = IdempotencyKey::generate();
        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.config.max_pending {
                return Err(RateLimitError("too many unacked messages in flight"));
            }
            pending.push_back(PendingMessage {
                idempotency_key: key.clone(),
                room_id: room_id.clone(),
                content: content.clone(),
                sent_at: chrono::Utc::now(),
            });
        }
        self.connection
            .send(Envelope::ChatMessage {
                room_id,
                idempotency_key: key.clone(),
                content,
                sender_id: None,
                server_seq: None,
            })
            .await;
        Ok(key)
    }

    async fn resend_pending(&self) {
        let backlog: Vec<PendingMessage> = {
            let pending = self.pending.lock().await;
            pending.iter().cloned().collect()
        };
        if backlog.is_empty() {
            return;
        }
        info!(
            target: "Messenger",
            "Resending {} unacked messages after reconnect",
            backlog.len()
        );
        for message in backlog {
            self.connection
                .send(Envelope::ChatMessage {
                    room_id: message.room_id,
                    idempotency_key: message.idempotency_key,
                    content: message.content,
                    sender_id: None,
                    server_seq: None,
                })
                .await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
