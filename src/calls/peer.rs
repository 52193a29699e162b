//! Seam between call orchestration and the actual WebRTC stack.
//!
//! The embedding application (mobile shell, desktop UI) implements these
//! traits over its platform WebRTC bindings. Call sessions only ever talk
//! to the trait, which keeps SDP sequencing testable without media.

use super::error::NegotiationError;
use crate::envelope::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The media tracks a session can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTrackKind {
    Audio,
    Video,
    Screen,
}

/// Events surfaced by a peer connection to its owning session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to relay to the remote peer.
    LocalCandidate(IceCandidate),
    /// An ICE path is established; media can flow.
    IceConnected,
    /// The ICE path degraded; may recover on its own.
    IceDisconnected,
    /// The ICE path is gone. The session decides between a restart and
    /// ending the call.
    IceFailed,
}

/// One WebRTC peer connection.
///
/// Contract: `close()` releases every track and OS resource the
/// implementation holds; it must be safe to call more than once.
/// `remove_track` on a track that is not attached is a no-op.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn add_track(&self, kind: MediaTrackKind) -> Result<(), NegotiationError>;

    async fn remove_track(&self, kind: MediaTrackKind) -> Result<(), NegotiationError>;

    /// Enables or disables a track without renegotiation (mute, camera off).
    async fn set_track_enabled(&self, kind: MediaTrackKind, enabled: bool);

    /// Begins an ICE restart on the existing connection.
    async fn restart_ice(&self) -> Result<(), NegotiationError>;

    /// Restricts further gathering to relay (TURN) candidates.
    async fn set_relay_only(&self);

    async fn close(&self);
}

/// Creates peer connections for new call sessions.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError>;
}
