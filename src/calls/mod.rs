//! WebRTC call orchestration: per-call state machines and the registry
//! that enforces one live call per room.
//!
//! Media itself stays outside this crate. The embedding application
//! implements [`peer::PeerConnection`] over its WebRTC stack; everything
//! here is signaling, sequencing and lifecycle.

pub mod error;
pub mod peer;
pub mod registry;
pub mod session;
pub mod state;

pub use error::{CallError, NegotiationError};
pub use peer::{MediaTrackKind, PeerConnection, PeerConnectionFactory, PeerEvent};
pub use registry::CallSessionRegistry;
pub use session::{CallOptions, CallSession};
pub use state::{CallPhase, CallRole};
