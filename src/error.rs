//! Error taxonomy for the session layer.
//!
//! Transport failures never escape `send()`; they drive the reconnect
//! policy internally and surface only as connection state. The types here
//! are what callers can actually observe.

use crate::envelope::{RoomId, SessionId};
use thiserror::Error;

/// Failures of the persistent signaling connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("authentication rejected by server")]
    AuthRejected,

    #[error("not connected")]
    NotConnected,
}

/// Inbound signaling that cannot be acted on. Logged and dropped, never
/// propagated to registry state.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
}

/// Too many in-flight messages or notifications.
#[derive(Debug, Error)]
#[error("rate limit exceeded: {0}")]
pub struct RateLimitError(pub &'static str);

/// Returned when starting a call in a room that already has a live one.
/// Upgrading audio to video goes through renegotiation on the existing
/// session, never a second session.
#[derive(Debug, Error)]
#[error("a call is already active in room {0}")]
pub struct AlreadyInCallError(pub RoomId);
