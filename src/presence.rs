//! Per-room typing indicators and online presence.

use crate::config::PresenceConfig;
use crate::connection::TransportConnection;
use crate::envelope::{Envelope, PresenceStatus, RoomId, UserId};
use crate::events::{PresenceEvent, TypingUpdate};
use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, broadcast};

/// One remote user's typing state in one room. Mutated only by inbound
/// events and the TTL sweep.
#[derive(Debug, Clone)]
pub struct TypingEntry {
    pub is_typing: bool,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    deadline: Instant,
}

/// Tracks who is online and who is typing, per room, on top of the
/// connection's event stream. Typing entries expire after a TTL so a peer
/// that vanishes mid-keystroke does not leave a stuck indicator.
pub struct PresenceTracker {
    connection: Arc<TransportConnection>,
    config: PresenceConfig,
    typing: DashMap<(RoomId, UserId), TypingEntry>,
    online: DashMap<UserId, PresenceStatus>,
    /// Last time we notified the server that the local user is typing,
    /// per room. Drives the outbound throttle.
    last_typing_sent: Mutex<HashMap<RoomId, Instant>>,
    shutdown: Notify,
}

impl PresenceTracker {
    pub fn new(connection: Arc<TransportConnection>, config: PresenceConfig) -> Arc<Self> {
        let tracker = Arc::new(Self {
            connection,
            config,
            typing: DashMap::new(),
            online: DashMap::new(),
            last_typing_sent: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        });
        // Subscribe before spawning so no envelope can slip past between
        // construction and the first poll of the loop.
        let inbound = tracker.connection.events().inbound.subscribe();
        let task = tracker.clone();
        tokio::spawn(async move { task.run(inbound).await });
        tracker
    }

    async fn run(self: Arc<Self>, mut inbound: broadcast::Receiver<Arc<Envelope>>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Ok(envelope) => self.handle_envelope(&envelope),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(target: "Presence", "Inbound stream lagged by {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = sweep.tick() => self.sweep_expired(),
                _ = self.shutdown.notified() => {
                    debug!(target: "Presence", "Shutdown signaled, exiting presence loop");
                    return;
                }
            }
        }
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match envelope {
            Envelope::TypingStart { room_id, user_id } => {
                // The server stamps the sender on fan-out; without it the
                // event cannot be attributed to anyone.
                let Some(user_id) = user_id else { return };
                self.typing.insert(
                    (room_id.clone(), user_id.clone()),
                    TypingEntry {
                        is_typing: true,
                        last_seen: chrono::Utc::now(),
                        deadline: Instant::now() + self.config.typing_ttl,
                    },
                );
                self.emit_typing(room_id, user_id, true);
            }
            Envelope::TypingStop { room_id, user_id } => {
                let Some(user_id) = user_id else { return };
                if self
                    .typing
                    .remove(&(room_id.clone(), user_id.clone()))
                    .is_some()
                {
                    self.emit_typing(room_id, user_id, false);
                }
            }
            Envelope::PresenceUpdate { user_id, status } => {
                self.online.insert(user_id.clone(), *status);
                let _ = self
                    .connection
                    .events()
                    .presence
                    .send(Arc::new(PresenceEvent {
                        user_id: user_id.clone(),
                        online: *status == PresenceStatus::Online,
                    }));
            }
            _ => {}
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(RoomId, UserId)> = self
            .typing
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            if self.typing.remove(&key).is_some() {
                debug!(target: "Presence", "Typing TTL expired for {} in {}", key.1, key.0);
                self.emit_typing(&key.0, &key.1, false);
            }
        }
    }

    fn emit_typing(&self, room_id: &RoomId, user_id: &UserId, is_typing: bool) {
        let _ = self.connection.events().typing.send(Arc::new(TypingUpdate {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            is_typing,
        }));
    }

    /// Reports the local user's typing state to the room. Starts are
    /// throttled to one notification per throttle interval while the user
    /// keeps typing; stops always go out immediately.
    pub async fn set_local_typing(&self, room_id: RoomId, is_typing: bool) {
        if is_typing {
            let mut last_sent = self.last_typing_sent.lock().await;
            if let Some(last) = last_sent.get(&room_id) {
                if last.elapsed() < self.config.typing_throttle {
                    return;
                }
            }
            last_sent.insert(room_id.clone(), Instant::now());
            drop(last_sent);
            self.connection
                .send(Envelope::TypingStart {
                    room_id,
                    user_id: None,
                })
                .await;
        } else {
            self.last_typing_sent.lock().await.remove(&room_id);
            self.connection
                .send(Envelope::TypingStop {
                    room_id,
                    user_id: None,
                })
                .await;
        }
    }

    /// O(1) lookup against the last presence-update seen for this user.
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.online
            .get(user_id)
            .map(|status| *status == PresenceStatus::Online)
            .unwrap_or(false)
    }

    /// Users currently typing in a room.
    pub fn typing_users(&self, room_id: &RoomId) -> Vec<UserId> {
        self.typing
            .iter()
            .filter(|entry| &entry.key().0 == room_id && entry.value().is_typing)
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}
