//! Client-side session layer for a room-based realtime service: one
//! resilient signaling connection shared by chat messaging, presence and
//! WebRTC call orchestration.
//!
//! The entry point is [`connection::TransportConnection`]; the feature
//! components ([`messenger::RoomMessenger`], [`presence::PresenceTracker`],
//! [`calls::CallSessionRegistry`]) each hold a handle to it and consume
//! its event bus.

pub mod auth;
pub mod calls;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod events;
pub mod messenger;
pub mod presence;
pub mod quality;
pub mod transport;

pub use auth::{AuthTokenProvider, StaticTokenProvider};
pub use config::{CallConfig, ConnectionConfig, MessengerConfig, PresenceConfig};
pub use connection::{ConnectionState, TransportConnection};
pub use envelope::{
    CallEndReason, Envelope, IceCandidate, IdempotencyKey, PresenceStatus, RoomId, SdpKind,
    SessionDescription, SessionId, UserId,
};
pub use error::{RateLimitError, SignalingError, TransportError};
pub use events::{
    CallEvent, DeliveredMessage, EventBus, MessageAck, PresenceEvent, QueueOverflow, TypingUpdate,
};
pub use messenger::RoomMessenger;
pub use presence::PresenceTracker;
pub use quality::ConnectionQuality;
