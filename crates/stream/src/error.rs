//! Error types for stream connections

use std::time::Duration;

use serde::Serialize;
use shardline_transport::TransportError;
use thiserror::Error;

/// Errors that end a stream connection
#[derive(Debug, Error)]
pub enum Error {
    /// The transport failed to open or read the connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The byte stream violated the framing rules
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    /// The connection did not become active in time
    #[error("Connection setup did not complete within {0:?}")]
    SetupTimeout(Duration),

    /// No data, heartbeats included, arrived in time
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    /// The remote endpoint ended the stream
    #[error("Stream ended by remote endpoint")]
    EndOfStream,
}

impl Error {
    /// Classify this error for status reporting
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) if e.is_auth() => ErrorKind::AuthFailure,
            Self::Framing(_) => ErrorKind::FramingError,
            Self::Transport(_) | Self::SetupTimeout(_) | Self::IdleTimeout(_) | Self::EndOfStream => {
                ErrorKind::TransportFailure
            }
        }
    }
}

/// Errors produced while splitting the byte stream into frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame grew past the configured limit without a delimiter
    #[error("Frame exceeds maximum length of {max} bytes")]
    TooLong {
        /// Configured maximum frame length
        max: usize,
    },

    /// The stream ended in the middle of a frame
    #[error("Stream ended with {len} bytes of an unterminated frame")]
    Truncated {
        /// Bytes left in the buffer
        len: usize,
    },

    /// I/O error raised through the codec
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error categories surfaced through connection and monitor status
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ErrorKind {
    /// A capacity of zero, or one above what the transport allows
    InvalidCapacity,
    /// The remote endpoint rejected the credentials
    AuthFailure,
    /// Network, handshake, timeout, or unexpected end of stream
    TransportFailure,
    /// The byte stream could not be split into frames
    FramingError,
    /// A replacement connection set did not become ready in time
    ConsolidationTimeout,
}

impl ErrorKind {
    /// Whether a retry should wait for the backoff delay even on the first failure
    #[must_use]
    pub const fn always_backs_off(self) -> bool {
        matches!(self, Self::AuthFailure)
    }
}
