//! Tunables for every component, with defaults matching production use.

use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const OUTBOUND_QUEUE_CAPACITY: usize = 128;
const LATENCY_WINDOW: usize = 8;

const TYPING_TTL: Duration = Duration::from_secs(4);
const TYPING_THROTTLE: Duration = Duration::from_secs(2);
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const DEDUP_CACHE_SIZE: usize = 512;
const MAX_PENDING_MESSAGES: usize = 256;

const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);
const ENDED_SESSION_GRACE: Duration = Duration::from_secs(30);
const MAX_ICE_RESTARTS: u8 = 1;

/// Configuration for the signaling connection and its reconnect policy.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the signaling relay.
    pub url: String,
    /// Bound on a single transport handshake. A hung connect counts as a
    /// failed attempt instead of stalling the reconnect loop.
    pub connect_timeout: Duration,
    /// Fixed heartbeat interval. Two consecutive missed pongs force a
    /// reconnect.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the reconnect delay.
    pub backoff_cap: Duration,
    /// Attempts before the connection gives up and reports Failed.
    pub max_reconnect_attempts: u32,
    /// Envelopes buffered while offline. Oldest entries are dropped beyond
    /// this, with a warning event.
    pub outbound_queue_capacity: usize,
    /// Number of heartbeat round-trips kept for the quality indicator.
    pub latency_window: usize,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/rtc".to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            latency_window: LATENCY_WINDOW,
        }
    }
}

/// Configuration for typing indicators and presence.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a typing indicator stays up without a refresh.
    pub typing_ttl: Duration,
    /// Minimum gap between outbound typing-start notifications while the
    /// local user keeps typing.
    pub typing_throttle: Duration,
    /// How often expired typing entries are swept.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_ttl: TYPING_TTL,
            typing_throttle: TYPING_THROTTLE,
            sweep_interval: TYPING_SWEEP_INTERVAL,
        }
    }
}

/// Configuration for chat message delivery.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Recent idempotency keys remembered for inbound de-duplication.
    pub dedup_cache_size: usize,
    /// Unacked messages allowed in flight before sends are rejected.
    pub max_pending: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: DEDUP_CACHE_SIZE,
            max_pending: MAX_PENDING_MESSAGES,
        }
    }
}

/// Configuration for call sessions and the registry.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Bound on ICE gathering before falling back to relay-only candidates.
    pub ice_gathering_timeout: Duration,
    /// How long an ended session is retained so late signaling is ignored
    /// instead of spawning a ghost session.
    pub ended_grace: Duration,
    /// Automatic ICE restarts before the call ends with a network reason.
    pub max_ice_restarts: u8,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout: ICE_GATHERING_TIMEOUT,
            ended_grace: ENDED_SESSION_GRACE,
            max_ice_restarts: MAX_ICE_RESTARTS,
        }
    }
}
