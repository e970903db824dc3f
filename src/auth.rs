//! Authentication seam.
//!
//! Token verification is out of scope for the protocol engine; it is
//! modeled as a capability check behind [`AuthVerifier`]. The connection
//! state machine calls it exactly once per `authenticate` RPC and maps the
//! error onto the wire's `AUTH_FAILED` code.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::messages::SatAuthHeaderPair;

/// The verified identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The client-supplied id, echoed from the auth request.
    pub client_id: String,
    /// The principal the token was issued for.
    pub subject: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Verifies a client's token and yields its identity.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(
        &self,
        client_id: &str,
        token: &str,
        headers: &[SatAuthHeaderPair],
    ) -> Result<ClientIdentity, AuthError>;
}
