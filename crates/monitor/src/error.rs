//! Error types for the monitor

use shardline_stream::ErrorKind;
use thiserror::Error;

/// Errors that can occur while configuring or driving a monitor
#[derive(Debug, Error)]
pub enum Error {
    /// Capacity is zero or larger than the transport allows per connection
    #[error("Invalid capacity {capacity}{}", .max.map(|max| format!(" (transport allows at most {max})")).unwrap_or_default())]
    InvalidCapacity {
        /// Configured capacity
        capacity: usize,
        /// Largest group the transport accepts, if it imposes a limit
        max: Option<usize>,
    },

    /// The monitor was already started
    #[error("Monitor already started")]
    AlreadyStarted,

    /// The monitor was never started
    #[error("Monitor not started")]
    NotStarted,

    /// Building a subject group failed
    #[error(transparent)]
    Subjects(#[from] shardline_subjects::Error),
}

impl Error {
    /// Category of this error, when it belongs to the reported taxonomy
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InvalidCapacity { .. } => Some(ErrorKind::InvalidCapacity),
            Self::AlreadyStarted | Self::NotStarted | Self::Subjects(_) => None,
        }
    }
}

/// Result type for monitor operations
pub type Result<T> = std::result::Result<T, Error>;
