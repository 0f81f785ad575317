//! Observable monitor state

use serde::Serialize;
use shardline_stream::{ConnectionState, ConnectionStatus, ErrorKind};
use shardline_subjects::SubjectId;

/// Snapshot of a monitor, replaced as a whole on every change
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MonitorStatus {
    /// Whether the coordinating task is running
    pub running: bool,
    /// Generation of the live connection set
    pub generation: u64,
    /// Number of monitored subjects
    pub monitored: usize,
    /// Connections of the live set
    pub live: Vec<ConnectionStatus>,
    /// Generation of the consolidation in progress, if any
    pub pending_generation: Option<u64>,
    /// New connections of the consolidation in progress
    pub pending: Vec<ConnectionStatus>,
    /// Replaced connections still draining
    pub retiring: Vec<ConnectionStatus>,
    /// Category of the most recent failure
    pub last_error: Option<ErrorKind>,
}

impl MonitorStatus {
    /// Number of dispatching connections currently carrying `subject`
    ///
    /// Counts live and retiring connections that are active or draining.
    #[must_use]
    pub fn coverage(&self, subject: SubjectId) -> usize {
        self.live
            .iter()
            .chain(&self.retiring)
            .filter(|status| {
                matches!(
                    status.state,
                    ConnectionState::Active | ConnectionState::Draining
                ) && status.group.contains(subject)
            })
            .count()
    }

    /// Number of live connections in `state`
    #[must_use]
    pub fn live_in_state(&self, state: ConnectionState) -> usize {
        self.live.iter().filter(|status| status.state == state).count()
    }

    /// Whether a consolidation is in progress
    #[must_use]
    pub const fn is_consolidating(&self) -> bool {
        self.pending_generation.is_some()
    }
}
