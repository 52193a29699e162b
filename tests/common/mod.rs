//! Shared test doubles: an in-memory transport the tests drive like a
//! signaling server, and a scriptable peer connection for call tests.

#![allow(dead_code)]

use async_trait::async_trait;
use roomlink::calls::{
    MediaTrackKind, NegotiationError, PeerConnection, PeerConnectionFactory, PeerEvent,
};
use roomlink::envelope::{Envelope, IceCandidate, SessionDescription};
use roomlink::transport::{Transport, TransportEvent, TransportFactory};
use roomlink::{
    AuthTokenProvider, CallConfig, ConnectionConfig, MessengerConfig, PresenceConfig,
    StaticTokenProvider, TransportConnection,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Fast-twitch config so reconnect tests finish in milliseconds instead
/// of minutes. The heartbeat is parked out of the way; heartbeat tests
/// bring their own interval.
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://test.invalid/rtc".to_string(),
        connect_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(60),
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        outbound_queue_capacity: 4,
        latency_window: 8,
    }
}

pub fn test_presence_config() -> PresenceConfig {
    PresenceConfig {
        typing_ttl: Duration::from_millis(120),
        typing_throttle: Duration::from_millis(80),
        sweep_interval: Duration::from_millis(20),
    }
}

pub fn test_messenger_config() -> MessengerConfig {
    MessengerConfig {
        dedup_cache_size: 16,
        max_pending: 3,
    }
}

pub fn test_call_config() -> CallConfig {
    CallConfig {
        ice_gathering_timeout: Duration::from_millis(200),
        ended_grace: Duration::from_millis(150),
        max_ice_restarts: 1,
    }
}

/// The server side of one in-memory connection. Frames the client sends
/// arrive here already parsed; `inject` plays the server's part.
pub struct ServerEnd {
    pub auth_token: String,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    event_tx: mpsc::Sender<TransportEvent>,
    send_fails: Arc<AtomicBool>,
}

impl ServerEnd {
    /// Delivers an envelope to the client as an inbound frame.
    pub async fn inject(&self, envelope: &Envelope) {
        let frame = serde_json::to_string(envelope).expect("envelope serializes");
        self.inject_raw(frame).await;
    }

    pub async fn inject_raw(&self, frame: String) {
        self.event_tx
            .send(TransportEvent::FrameReceived(frame))
            .await
            .expect("client read loop gone");
    }

    /// Simulates the network dropping out from under the client.
    pub async fn drop_connection(&self) {
        let _ = self.event_tx.send(TransportEvent::Disconnected).await;
    }

    /// Makes subsequent `send_frame` calls on this transport fail.
    pub fn break_sends(&self) {
        self.send_fails.store(true, Ordering::Relaxed);
    }

    /// Next frame the client sent, or panic after a grace period.
    pub async fn next_frame(&mut self) -> Envelope {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("transport closed")
    }

    /// Next frame that is not a heartbeat ping.
    pub async fn next_non_heartbeat(&mut self) -> Envelope {
        loop {
            match self.next_frame().await {
                Envelope::HeartbeatPing { .. } => continue,
                other => return other,
            }
        }
    }

    /// Answers pings so the heartbeat never trips during longer tests.
    pub async fn answer_ping(&mut self, envelope: &Envelope) -> bool {
        if let Envelope::HeartbeatPing { sent_at } = envelope {
            self.inject(&Envelope::HeartbeatPong { sent_at: *sent_at })
                .await;
            true
        } else {
            false
        }
    }

    pub async fn assert_no_frame(&mut self, window: Duration) {
        if let Ok(Some(frame)) = timeout(window, self.outbound.recv()).await {
            if !matches!(frame, Envelope::HeartbeatPing { .. }) {
                panic!("unexpected frame: {frame:?}");
            }
        }
    }
}

struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Envelope>,
    event_tx: mpsc::Sender<TransportEvent>,
    send_fails: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        if self.send_fails.load(Ordering::Relaxed) {
            anyhow::bail!("transport write failed");
        }
        let envelope: Envelope = serde_json::from_str(frame)?;
        self.outbound
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("server end dropped"))
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(TransportEvent::Disconnected).await;
        }
    }
}

/// Hands out one in-memory connection per connect attempt and delivers
/// the matching [`ServerEnd`] to the test.
pub struct MemoryTransportFactory {
    server_ends: mpsc::UnboundedSender<ServerEnd>,
    fail_connects: AtomicU32,
    pub connect_count: AtomicU32,
}

impl MemoryTransportFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                server_ends: tx,
                fail_connects: AtomicU32::new(0),
                connect_count: AtomicU32::new(0),
            }),
            rx,
        )
    }

    /// The next `n` connect attempts fail before producing a transport.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create_transport(
        &self,
        _url: &str,
        auth_token: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let failures = self.fail_connects.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_connects.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let send_fails = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(MemoryTransport {
            outbound: outbound_tx,
            event_tx: event_tx.clone(),
            send_fails: send_fails.clone(),
            closed: AtomicBool::new(false),
        });
        let _ = event_tx.try_send(TransportEvent::Connected);
        let _ = self.server_ends.send(ServerEnd {
            auth_token: auth_token.to_string(),
            outbound: outbound_rx,
            event_tx,
            send_fails,
        });
        Ok((transport, event_rx))
    }
}

/// Spins up a connection against the in-memory factory and waits for the
/// first server end.
pub async fn connected_client() -> (
    Arc<TransportConnection>,
    Arc<MemoryTransportFactory>,
    mpsc::UnboundedReceiver<ServerEnd>,
    ServerEnd,
) {
    connected_client_with(test_connection_config()).await
}

pub async fn connected_client_with(
    config: ConnectionConfig,
) -> (
    Arc<TransportConnection>,
    Arc<MemoryTransportFactory>,
    mpsc::UnboundedReceiver<ServerEnd>,
    ServerEnd,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (factory, mut server_ends) = MemoryTransportFactory::new();
    let auth: Arc<dyn AuthTokenProvider> =
        Arc::new(StaticTokenProvider("test-token".to_string()));
    let connection = TransportConnection::new(config, factory.clone(), auth);
    tokio::spawn(connection.clone().run());
    let server = timeout(WAIT, server_ends.recv())
        .await
        .expect("timed out waiting for connect")
        .expect("factory dropped");
    (connection, factory, server_ends, server)
}

/// Waits for the next server end after a reconnect.
pub async fn next_server_end(server_ends: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    timeout(WAIT, server_ends.recv())
        .await
        .expect("timed out waiting for reconnect")
        .expect("factory dropped")
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate(String),
    AddTrack(MediaTrackKind),
    RemoveTrack(MediaTrackKind),
    SetTrackEnabled(MediaTrackKind, bool),
    RestartIce,
    RelayOnly,
    Close,
}

/// Scriptable peer connection: records every call and can be told to
/// fail specific operations.
pub struct MockPeer {
    ops: StdMutex<Vec<PeerOp>>,
    pub fail_create_offer: AtomicBool,
    pub fail_create_answer: AtomicBool,
    pub fail_set_remote: AtomicBool,
    pub fail_restart_ice: AtomicBool,
    events: mpsc::Sender<PeerEvent>,
}

impl MockPeer {
    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().expect("ops lock").clone()
    }

    pub fn candidate_order(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> bool {
        self.ops().contains(&PeerOp::Close)
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().expect("ops lock").push(op);
    }

    /// Drives the session through ICE as if the path came up.
    pub async fn emit(&self, event: PeerEvent) {
        self.events.send(event).await.expect("session event loop gone");
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_create_offer.load(Ordering::Relaxed) {
            return Err(NegotiationError::Sdp("mock offer failure".into()));
        }
        self.record(PeerOp::CreateOffer);
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_create_answer.load(Ordering::Relaxed) {
            return Err(NegotiationError::Sdp("mock answer failure".into()));
        }
        self.record(PeerOp::CreateAnswer);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(PeerOp::SetLocal);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.fail_set_remote.load(Ordering::Relaxed) {
            return Err(NegotiationError::Sdp("mock remote rejection".into()));
        }
        self.record(PeerOp::SetRemote);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, kind: MediaTrackKind) -> Result<(), NegotiationError> {
        self.record(PeerOp::AddTrack(kind));
        Ok(())
    }

    async fn remove_track(&self, kind: MediaTrackKind) -> Result<(), NegotiationError> {
        self.record(PeerOp::RemoveTrack(kind));
        Ok(())
    }

    async fn set_track_enabled(&self, kind: MediaTrackKind, enabled: bool) {
        self.record(PeerOp::SetTrackEnabled(kind, enabled));
    }

    async fn restart_ice(&self) -> Result<(), NegotiationError> {
        if self.fail_restart_ice.load(Ordering::Relaxed) {
            return Err(NegotiationError::Ice("mock restart failure".into()));
        }
        self.record(PeerOp::RestartIce);
        Ok(())
    }

    async fn set_relay_only(&self) {
        self.record(PeerOp::RelayOnly);
    }

    async fn close(&self) {
        self.record(PeerOp::Close);
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    peers: StdMutex<Vec<Arc<MockPeer>>>,
    /// Pre-arms `fail_create_offer` on the next peer created, for setup
    /// failures where the test never sees the peer before the call starts.
    pub fail_next_offer: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most recently created peer.
    pub fn last_peer(&self) -> Arc<MockPeer> {
        self.peers
            .lock()
            .expect("peers lock")
            .last()
            .cloned()
            .expect("no peer created yet")
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers lock").len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create_peer(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError> {
        let (event_tx, event_rx) = mpsc::channel(16);
        let fail_offer = self.fail_next_offer.swap(false, Ordering::SeqCst);
        let peer = Arc::new(MockPeer {
            ops: StdMutex::new(Vec::new()),
            fail_create_offer: AtomicBool::new(fail_offer),
            fail_create_answer: AtomicBool::new(false),
            fail_set_remote: AtomicBool::new(false),
            fail_restart_ice: AtomicBool::new(false),
            events: event_tx,
        });
        self.peers.lock().expect("peers lock").push(peer.clone());
        Ok((peer, event_rx))
    }
}
