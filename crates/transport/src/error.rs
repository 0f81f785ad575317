//! Error types for transport operations

use thiserror::Error;

/// Errors that can occur while opening or reading a streaming connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote endpoint rejected the credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote endpoint answered with an unexpected status
    #[error("Request rejected with status {status}: {reason}")]
    Rejected {
        /// Status code returned by the remote endpoint
        status: u16,
        /// Reason phrase or body excerpt
        reason: String,
    },

    /// Establishing the connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The configured endpoint is unusable
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// More subjects were requested than a single connection may carry
    #[error("Group of {size} subjects exceeds the limit of {max}")]
    GroupTooLarge {
        /// Requested group size
        size: usize,
        /// Maximum allowed by the endpoint
        max: usize,
    },

    /// Signing the request failed
    #[error("Failed to sign request: {0}")]
    Signing(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is closed
    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether this error means the credentials were not accepted
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
