//! Typed event bus connecting the session layer to its consumers.
//!
//! The UI subscribes to these channels and never mutates component state
//! directly. Components publish here and also listen on the low-level
//! `inbound` channel for the envelopes they own.

use crate::calls::state::CallPhase;
use crate::connection::ConnectionState;
use crate::envelope::{
    CallEndReason, Envelope, IdempotencyKey, RoomId, SessionDescription, SessionId, UserId,
};
use crate::quality::ConnectionQuality;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        /// A closed set of channels replaces string-keyed dynamic event registration.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connection_state, ConnectionState),
    (connection_quality, ConnectionQuality),
    (queue_overflow, Arc<QueueOverflow>),

    // Raw inbound envelopes, consumed by the messenger, presence tracker
    // and call registry
    (inbound, Arc<Envelope>),

    // Chat events
    (message, Arc<DeliveredMessage>),
    (message_ack, Arc<MessageAck>),

    // Presence events
    (typing, Arc<TypingUpdate>),
    (presence, Arc<PresenceEvent>),

    // Call events
    (call, Arc<CallEvent>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The offline outbound queue hit capacity and dropped its oldest entry.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOverflow {
    pub dropped: Envelope,
    pub capacity: usize,
}

/// A chat message delivered to listeners, exactly once per idempotency key.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveredMessage {
    pub room_id: RoomId,
    pub idempotency_key: IdempotencyKey,
    pub content: String,
    pub sender_id: Option<UserId>,
    pub server_seq: Option<u64>,
}

/// The server acknowledged one of our outbound messages.
#[derive(Debug, Clone, Serialize)]
pub struct MessageAck {
    pub idempotency_key: IdempotencyKey,
    pub server_seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypingUpdate {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub online: bool,
}

/// Everything the UI needs to know about calls.
#[derive(Debug, Clone, Serialize)]
pub enum CallEvent {
    /// A remote peer is calling; accept with
    /// [`CallSession::accept_offer`](crate::calls::session::CallSession::accept_offer).
    Incoming {
        session_id: SessionId,
        room_id: RoomId,
        sdp: SessionDescription,
    },
    PhaseChanged {
        session_id: SessionId,
        phase: CallPhase,
    },
    /// Recoverable problem, e.g. a failed screen-share renegotiation that
    /// was rolled back. The call goes on.
    Warning {
        session_id: SessionId,
        message: String,
    },
    Ended {
        session_id: SessionId,
        reason: CallEndReason,
    },
}
