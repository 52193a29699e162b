//! Call-related error types.

use super::state::InvalidTransition;
use crate::error::AlreadyInCallError;
use thiserror::Error;

/// Failure of an SDP/ICE exchange.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("SDP exchange failed: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("ICE gathering timed out")]
    GatheringTimeout,

    #[error("peer connection unavailable: {0}")]
    Peer(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    AlreadyInCall(#[from] AlreadyInCallError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("session already ended")]
    SessionEnded,
}
