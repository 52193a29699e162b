//! Seam to the authentication layer.

use async_trait::async_trait;

/// Supplies the bearer token for the signaling handshake.
///
/// The connection asks for a fresh token on every (re)connect, so rotating
/// the token only requires forcing a reconnect
/// ([`TransportConnection::refresh_token`](crate::connection::TransportConnection::refresh_token)).
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, anyhow::Error>;
}

/// Fixed token, for tests and tooling.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, anyhow::Error> {
        Ok(self.0.clone())
    }
}
