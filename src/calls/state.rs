//! Call state machine implementation.

use serde::Serialize;
use std::fmt;

/// Which side of the call this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Initiator,
    Responder,
}

/// Current phase of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    /// Created, no SDP exchanged yet.
    #[default]
    Idle,
    /// Offer/answer exchange in flight.
    Negotiating,
    /// Descriptions applied, waiting for an ICE path.
    ConnectingIce,
    /// Media flowing.
    Connected,
    /// Mid-call offer/answer exchange (screen share, video upgrade).
    Renegotiating,
    /// Terminal: ended by either side.
    Ended,
    /// Terminal: initial setup failed.
    Failed,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Apply a state transition. Returns an error if the transition is
    /// invalid for the current phase.
    pub fn apply(self, transition: CallTransition) -> Result<CallPhase, InvalidTransition> {
        use CallPhase::*;
        use CallTransition::*;
        let next = match (self, transition) {
            (Idle, OfferSent) => Negotiating,
            (Idle, OfferAccepted) => Negotiating,
            (Negotiating, AnswerSent) => ConnectingIce,
            (Negotiating, AnswerReceived) => ConnectingIce,
            (ConnectingIce, IceConnected) => Connected,
            (Connected, RenegotiationStarted) => Renegotiating,
            (Renegotiating, RenegotiationCompleted) => Connected,
            // Rollback path: the failed exchange is discarded, the call
            // keeps its previous track set.
            (Renegotiating, RenegotiationFailed) => Connected,
            (Idle | Negotiating | ConnectingIce | Connected | Renegotiating, Terminated) => Ended,
            (Idle | Negotiating | ConnectingIce | Connected | Renegotiating, SetupFailed) => Failed,
            (current, attempted) => {
                return Err(InvalidTransition {
                    from: current,
                    attempted: format!("{attempted:?}"),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone, Copy)]
pub enum CallTransition {
    OfferSent,
    OfferAccepted,
    AnswerSent,
    AnswerReceived,
    IceConnected,
    RenegotiationStarted,
    RenegotiationCompleted,
    RenegotiationFailed,
    Terminated,
    SetupFailed,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: CallPhase,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {} in phase {}", self.attempted, self.from)
    }
}

impl std::error::Error for InvalidTransition {}
