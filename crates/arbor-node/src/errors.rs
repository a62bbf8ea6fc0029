//! Arbor node error types.
//!
//! Every rejected inbound message maps to exactly one protocol reply before
//! the connection closes; [`NodeError::client_info`] produces the reply text
//! without leaking internal details.

use thiserror::Error;

/// Arbor node error type.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Input failed to parse or was missing required fields.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Command used from the wrong session state (unauthenticated server,
    /// not-logged-in client, or the reverse).
    #[error("command {0} not permitted in this session state")]
    Unauthorized(&'static str),

    /// Username already known, locally or via the lock flood.
    #[error("username {0} already registered")]
    RegistrationConflict(String),

    /// LOGIN credential did not match the stored record.
    #[error("credential mismatch")]
    CredentialMismatch,

    /// Outbound server handshake failed (connect, secret, or protocol).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer channel is gone; the write was dropped.
    #[error("channel closed")]
    ChannelClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal plumbing error (actor mailbox, oneshot reply).
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Client-safe reply text for protocol responses.
    ///
    /// Internal details are logged server-side; peers only see what they
    /// need to act on.
    #[must_use]
    pub fn client_info(&self) -> String {
        match self {
            NodeError::Malformed(info) => format!("invalid message: {info}"),
            NodeError::Unauthorized(command) => {
                format!("{command} not permitted in this session state")
            }
            NodeError::RegistrationConflict(username) => {
                format!("{username} is already registered with the system")
            }
            NodeError::CredentialMismatch => "attempt to login with wrong secret".to_string(),
            NodeError::Handshake(_)
            | NodeError::ChannelClosed
            | NodeError::Config(_)
            | NodeError::Io(_)
            | NodeError::Internal(_) => "an internal error occurred".to_string(),
        }
    }
}
