//! Connection identity, lifecycle state and status snapshots

use std::fmt;

use serde::Serialize;
use shardline_subjects::Group;

use crate::error::ErrorKind;

/// Identifies a connection by the set generation that created it and its
/// position within that set
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ConnectionId {
    /// Generation of the connection set that created the connection
    pub generation: u64,
    /// Position of the connection's group within that set
    pub index: usize,
}

impl ConnectionId {
    /// Create a new connection id
    #[must_use]
    pub const fn new(generation: u64, index: usize) -> Self {
        Self { generation, index }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}/c{}", self.generation, self.index)
    }
}

/// Lifecycle state of a stream connection
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ConnectionState {
    /// Handshake and request in progress
    Connecting,
    /// Reading frames
    Active,
    /// Still reading, but about to be replaced
    Draining,
    /// Shut down on request
    Closed,
    /// Ended by an error
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Active | Self::Closed | Self::Failed)
                | (Self::Active, Self::Draining | Self::Closed | Self::Failed)
                | (Self::Draining, Self::Closed)
        )
    }

    /// Whether no further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the connection is still running
    #[must_use]
    pub const fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a single connection
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Connection identity
    pub id: ConnectionId,
    /// Subjects served by the connection
    pub group: Group,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Category of the error that failed the connection, if any
    pub last_error: Option<ErrorKind>,
}

/// Notification that a connection changed state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionEvent {
    /// Connection that changed state
    pub id: ConnectionId,
    /// State the connection moved to
    pub state: ConnectionState,
    /// Error category when the new state is [`ConnectionState::Failed`]
    pub error: Option<ErrorKind>,
}
