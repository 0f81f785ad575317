//! Immutable snapshots of the connections covering the monitored set

use std::sync::Arc;

use shardline_stream::{ConnectionId, ConnectionStatus, StreamConnection};
use shardline_subjects::Group;

/// The connections covering the monitored set at one generation
///
/// A set is never modified once built; replacing or adding a connection
/// produces a new set with a new generation. Connections may be shared with
/// a later set when their group is unchanged.
#[derive(Clone, Debug, Default)]
pub struct ConnectionSet {
    generation: u64,
    connections: Vec<Arc<StreamConnection>>,
}

impl ConnectionSet {
    /// Create a set from connections ordered like their groups
    #[must_use]
    pub const fn new(generation: u64, connections: Vec<Arc<StreamConnection>>) -> Self {
        Self {
            generation,
            connections,
        }
    }

    /// Generation of this set
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Connections in group order
    #[must_use]
    pub fn connections(&self) -> &[Arc<StreamConnection>] {
        &self.connections
    }

    /// Number of connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the set has no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The group partition served by this set, for structural comparison
    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        self.connections
            .iter()
            .map(|connection| connection.group().clone())
            .collect()
    }

    /// Position of the connection with `id`
    #[must_use]
    pub fn position(&self, id: ConnectionId) -> Option<usize> {
        self.connections
            .iter()
            .position(|connection| connection.id() == id)
    }

    /// Whether a connection with `id` belongs to this set
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.position(id).is_some()
    }

    /// A new set at `generation` with the connection at `index` replaced
    #[must_use]
    pub fn replace(&self, generation: u64, index: usize, connection: Arc<StreamConnection>) -> Self {
        let mut connections = self.connections.clone();
        if let Some(slot) = connections.get_mut(index) {
            *slot = connection;
        }
        Self::new(generation, connections)
    }

    /// Status of every connection in group order
    #[must_use]
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|connection| connection.status())
            .collect()
    }
}
