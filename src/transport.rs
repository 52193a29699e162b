//! Transport seam, re-exported from the transport member crate.
//!
//! The connection layer only ever sees these traits; swapping the
//! WebSocket implementation (or substituting an in-memory one in tests)
//! never touches the session logic.

pub use roomlink_tokio_transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};
