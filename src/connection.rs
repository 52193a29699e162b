//! The persistent signaling connection shared by every room and call.
//!
//! One `TransportConnection` per client process, owned explicitly by the
//! application context and handed to dependents. It owns the connection
//! state machine, the reconnect/backoff loop, the heartbeat, the joined
//! room set and the bounded offline queue. Consumers attach through the
//! [`EventBus`], never by reaching into this struct.

use crate::auth::AuthTokenProvider;
use crate::config::ConnectionConfig;
use crate::envelope::{Envelope, RoomId};
use crate::error::{SignalingError, TransportError};
use crate::events::{EventBus, QueueOverflow};
use crate::quality::{ConnectionQuality, LatencyWindow};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::sleep;

/// Connection lifecycle. Owned exclusively by [`TransportConnection`];
/// everyone else observes it through the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: reconnect attempts exhausted or explicitly disconnected.
    Failed,
}

pub struct TransportConnection {
    config: ConnectionConfig,
    transport_factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthTokenProvider>,
    bus: EventBus,

    state: StdMutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    joined_rooms: Mutex<HashSet<RoomId>>,
    outbound_queue: Mutex<VecDeque<Envelope>>,
    latency: StdMutex<LatencyWindow>,
    quality: StdMutex<ConnectionQuality>,

    /// Pings sent without a matching pong. Two strikes force a reconnect.
    pending_pongs: AtomicU32,
    /// Bumped on every new transport; stale heartbeat loops notice and exit.
    connection_epoch: AtomicU64,

    is_running: AtomicBool,
    is_connecting: AtomicBool,
    enable_auto_reconnect: AtomicBool,
    auto_reconnect_errors: AtomicU32,
    expected_disconnect: AtomicBool,
    has_connected_once: AtomicBool,
    shutdown_notifier: Notify,
}

impl TransportConnection {
    pub fn new(
        config: ConnectionConfig,
        transport_factory: Arc<dyn TransportFactory>,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Arc<Self> {
        let latency_window = config.latency_window;
        Arc::new(Self {
            config,
            transport_factory,
            auth,
            bus: EventBus::new(),
            state: StdMutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            joined_rooms: Mutex::new(HashSet::new()),
            outbound_queue: Mutex::new(VecDeque::new()),
            latency: StdMutex::new(LatencyWindow::new(latency_window)),
            quality: StdMutex::new(ConnectionQuality::Offline),
            pending_pongs: AtomicU32::new(0),
            connection_epoch: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            enable_auto_reconnect: AtomicBool::new(true),
            auto_reconnect_errors: AtomicU32::new(0),
            expected_disconnect: AtomicBool::new(false),
            has_connected_once: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.quality.lock().expect("quality lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub async fn joined_rooms(&self) -> HashSet<RoomId> {
        self.joined_rooms.lock().await.clone()
    }

    fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == new_state {
                return;
            }
            debug!(target: "Connection", "State {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
        let _ = self.bus.connection_state.send(new_state);
    }

    fn update_quality(&self) {
        let connected = self.is_connected();
        let new_quality = self
            .latency
            .lock()
            .expect("latency lock poisoned")
            .quality(connected);
        {
            let mut quality = self.quality.lock().expect("quality lock poisoned");
            if *quality == new_quality {
                return;
            }
            *quality = new_quality;
        }
        let _ = self.bus.connection_quality.send(new_quality);
    }

    /// The main connection loop: connect, pump events, reconnect with
    /// capped exponential backoff until attempts run out or someone calls
    /// [`disconnect`](Self::disconnect). Spawn this once per connection.
    pub async fn run(self: Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Connection", "run() called while already running");
            return;
        }
        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Ok(mut events) => {
                    self.read_loop(&mut events).await;
                    self.cleanup_connection_state().await;
                }
                Err(e) => {
                    warn!(target: "Connection", "Connect attempt failed: {e}");
                }
            }

            if !self.enable_auto_reconnect.load(Ordering::Relaxed) {
                info!(target: "Connection", "Auto-reconnect disabled, shutting down");
                self.is_running.store(false, Ordering::Relaxed);
                break;
            }

            // Expected disconnects (token refresh) reconnect immediately.
            if self.expected_disconnect.load(Ordering::Relaxed) {
                self.auto_reconnect_errors.store(0, Ordering::Relaxed);
                info!(target: "Connection", "Expected disconnect, reconnecting immediately");
                continue;
            }

            let error_count = self.auto_reconnect_errors.fetch_add(1, Ordering::SeqCst);
            if error_count >= self.config.max_reconnect_attempts {
                error!(
                    target: "Connection",
                    "Giving up after {} reconnect attempts", error_count
                );
                self.set_state(ConnectionState::Failed);
                self.update_quality();
                self.is_running.store(false, Ordering::Relaxed);
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            self.update_quality();

            let delay = jittered(backoff_delay(
                self.config.backoff_base,
                self.config.backoff_cap,
                error_count,
            ));
            info!(
                target: "Connection",
                "Will attempt to reconnect in {:?} (attempt {})",
                delay,
                error_count + 1
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Connection", "Shutdown during backoff");
                    break;
                }
            }
        }
        info!(target: "Connection", "Connection loop has shut down");
    }

    async fn connect(
        self: &Arc<Self>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("already connecting".into()));
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        self.set_state(if self.has_connected_once.load(Ordering::Relaxed) {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let token = self.auth.token().await.map_err(|e| {
            warn!(target: "Connection", "Token fetch failed: {e}");
            TransportError::AuthRejected
        })?;

        let (transport, events) = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport_factory.create_transport(&self.config.url, &token),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        *self.transport.lock().await = Some(transport);
        self.pending_pongs.store(0, Ordering::Relaxed);
        self.latency.lock().expect("latency lock poisoned").clear();
        self.connection_epoch.fetch_add(1, Ordering::SeqCst);
        self.auto_reconnect_errors.store(0, Ordering::Relaxed);
        self.has_connected_once.store(true, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        self.update_quality();

        let heartbeat = self.clone();
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        // Order matters: rooms first so the server routes queued envelopes,
        // then the offline queue in original enqueue order.
        self.replay_joined_rooms().await;
        self.flush_outbound_queue().await;

        Ok(events)
    }

    async fn read_loop(&self, events: &mut mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(TransportEvent::Connected) => {
                        debug!(target: "Connection", "Transport reports connected");
                    }
                    Some(TransportEvent::FrameReceived(text)) => {
                        self.handle_frame(&text).await;
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!(target: "Connection", "Transport disconnected");
                        return;
                    }
                },
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Connection", "Shutdown signaled, leaving read loop");
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(Envelope::HeartbeatPong { sent_at }) => {
                self.pending_pongs.store(0, Ordering::Relaxed);
                let now = chrono::Utc::now().timestamp_millis();
                let rtt = Duration::from_millis((now - sent_at).max(0) as u64);
                debug!(target: "Connection/Heartbeat", "Pong received, rtt {rtt:?}");
                self.latency
                    .lock()
                    .expect("latency lock poisoned")
                    .record(rtt);
                self.update_quality();
            }
            Ok(Envelope::HeartbeatPing { sent_at }) => {
                // The relay may probe us too; answer with its own timestamp.
                if let Err(e) = self.send_now(&Envelope::HeartbeatPong { sent_at }).await {
                    warn!(target: "Connection/Heartbeat", "Failed to answer ping: {e}");
                }
            }
            Ok(envelope) => {
                let _ = self.bus.inbound.send(Arc::new(envelope));
            }
            Err(e) => {
                let err = SignalingError::MalformedEnvelope(e.to_string());
                warn!(target: "Connection", "Dropping inbound frame: {err}");
            }
        }
    }

    /// Fixed-interval ping loop for one transport. Two pings without a pong
    /// force a reconnect within one interval of the second miss.
    async fn heartbeat_loop(self: Arc<Self>) {
        let epoch = self.connection_epoch.load(Ordering::SeqCst);
        loop {
            tokio::select! {
                _ = sleep(self.config.heartbeat_interval) => {
                    if self.connection_epoch.load(Ordering::SeqCst) != epoch
                        || !self.is_connected()
                    {
                        debug!(target: "Connection/Heartbeat", "Connection gone, exiting heartbeat loop");
                        return;
                    }

                    if self.pending_pongs.load(Ordering::Relaxed) >= 2 {
                        warn!(target: "Connection/Heartbeat", "Two heartbeat pongs missed, forcing reconnect");
                        self.set_state(ConnectionState::Reconnecting);
                        self.update_quality();
                        let transport = self.transport.lock().await.take();
                        if let Some(transport) = transport {
                            transport.disconnect().await;
                        }
                        return;
                    }

                    let ping = Envelope::HeartbeatPing {
                        sent_at: chrono::Utc::now().timestamp_millis(),
                    };
                    self.pending_pongs.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.send_now(&ping).await {
                        warn!(target: "Connection/Heartbeat", "Ping send failed: {e}");
                    }
                }
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Connection/Heartbeat", "Shutdown signaled, exiting heartbeat loop");
                    return;
                }
            }
        }
    }

    async fn cleanup_connection_state(&self) {
        *self.transport.lock().await = None;
        self.pending_pongs.store(0, Ordering::Relaxed);
        self.connection_epoch.fetch_add(1, Ordering::SeqCst);
        if self.enable_auto_reconnect.load(Ordering::Relaxed)
            && !self.expected_disconnect.load(Ordering::Relaxed)
        {
            self.set_state(ConnectionState::Reconnecting);
        }
        self.update_quality();
    }

    /// Marks a room as joined and announces it. The room is rejoined
    /// automatically after every reconnect until [`leave_room`](Self::leave_room).
    pub async fn join_room(&self, room_id: RoomId) {
        self.joined_rooms.lock().await.insert(room_id.clone());
        self.send(Envelope::JoinRoom { room_id }).await;
    }

    pub async fn leave_room(&self, room_id: RoomId) {
        self.joined_rooms.lock().await.remove(&room_id);
        self.send(Envelope::LeaveRoom { room_id }).await;
    }

    /// Sends an envelope, or queues it while offline. Never fails
    /// synchronously: transport trouble surfaces as connection state, not
    /// as an error from here.
    pub async fn send(&self, envelope: Envelope) {
        if self.is_connected() {
            match self.send_now(&envelope).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(target: "Connection", "Send failed, queueing envelope: {e}");
                }
            }
        }
        self.enqueue(envelope).await;
    }

    async fn send_now(&self, envelope: &Envelope) -> Result<(), anyhow::Error> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let frame = serde_json::to_string(envelope)?;
        transport.send_frame(&frame).await
    }

    async fn enqueue(&self, envelope: Envelope) {
        let mut queue = self.outbound_queue.lock().await;
        if queue.len() >= self.config.outbound_queue_capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(target: "Connection", "Outbound queue full, dropping oldest envelope");
                let _ = self.bus.queue_overflow.send(Arc::new(QueueOverflow {
                    dropped,
                    capacity: self.config.outbound_queue_capacity,
                }));
            }
        }
        queue.push_back(envelope);
    }

    async fn replay_joined_rooms(&self) {
        let rooms: Vec<RoomId> = self.joined_rooms.lock().await.iter().cloned().collect();
        for room_id in rooms {
            debug!(target: "Connection", "Rejoining room {room_id}");
            if let Err(e) = self.send_now(&Envelope::JoinRoom { room_id }).await {
                warn!(target: "Connection", "Room rejoin failed: {e}");
                return;
            }
        }
    }

    async fn flush_outbound_queue(&self) {
        let drained: Vec<Envelope> = {
            let mut queue = self.outbound_queue.lock().await;
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(target: "Connection", "Flushing {} queued envelopes", drained.len());
        let mut failed_at: Option<usize> = None;
        for (i, envelope) in drained.iter().enumerate() {
            if let Err(e) = self.send_now(envelope).await {
                warn!(target: "Connection", "Queue flush interrupted: {e}");
                failed_at = Some(i);
                break;
            }
        }
        if let Some(i) = failed_at {
            let mut queue = self.outbound_queue.lock().await;
            for envelope in drained.into_iter().skip(i).rev() {
                queue.push_front(envelope);
            }
        }
    }

    /// Forces a reconnect so the next handshake picks up a fresh token from
    /// the [`AuthTokenProvider`].
    pub async fn refresh_token(&self) {
        info!(target: "Connection", "Token refresh requested, forcing reconnect");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
    }

    /// Permanently stops the connection. Terminal; create a new instance to
    /// connect again.
    pub async fn disconnect(&self) {
        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        self.shutdown_notifier.notify_waiters();
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.update_quality();
    }
}

fn backoff_delay(base: Duration, cap: Duration, errors: u32) -> Duration {
    let factor = 2u32.saturating_pow(errors.min(16));
    base.saturating_mul(factor).min(cap)
}

fn jittered(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    let jitter = rand::rng().random_range(0..=half);
    delay + Duration::from_millis(jitter)
}
