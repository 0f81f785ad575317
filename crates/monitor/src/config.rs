//! Monitor configuration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardline_stream::{
    ConnectionOptions, DEFAULT_CONTROL_PREFIX, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_PENDING_FRAMES,
    DEFAULT_READ_CHUNK_SIZE, DEFAULT_SETUP_TIMEOUT, MAX_FRAME_LEN,
};

use crate::error::{Error, Result};

/// Configuration for a [`crate::Monitor`]
///
/// Durations are written as human readable strings such as `"90s"`,
/// `"250ms"` or `"1m30s"`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Maximum subjects per connection
    pub capacity_per_connection: usize,
    /// Deadline for a connection to become active
    #[serde(with = "crate::serde_duration")]
    pub setup_timeout: Duration,
    /// Deadline between two reads of an active connection
    #[serde(with = "crate::serde_duration")]
    pub idle_timeout: Duration,
    /// How long a new connection must stay active before it replaces the old ones
    #[serde(with = "crate::serde_duration")]
    pub grace_interval: Duration,
    /// Period of the efficiency check
    #[serde(with = "crate::serde_duration")]
    pub reevaluation_interval: Duration,
    /// How long replaced connections keep dispatching before they are closed
    #[serde(with = "crate::serde_duration")]
    pub drain_interval: Duration,
    /// Retry policy for failed connections and aborted consolidations
    pub backoff: BackoffConfig,
    /// Upper bound on the bytes taken from the transport per read
    pub read_chunk_size: usize,
    /// Largest frame accepted, delimiter excluded
    pub max_frame_len: usize,
    /// Frames a connection buffers before it goes live
    pub max_pending_frames: usize,
    /// Prefixes tagging control frames
    pub control_prefixes: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity_per_connection: 100,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            grace_interval: Duration::from_secs(15),
            reevaluation_interval: Duration::from_secs(60),
            drain_interval: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_frame_len: MAX_FRAME_LEN,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            control_prefixes: vec![DEFAULT_CONTROL_PREFIX.to_string()],
        }
    }
}

impl MonitorConfig {
    /// Check the configuration against the transport's group limit
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] if the capacity is zero or exceeds
    /// `max_group_size`.
    pub fn validate(&self, max_group_size: Option<usize>) -> Result<()> {
        let capacity = self.capacity_per_connection;
        if capacity == 0 || max_group_size.is_some_and(|max| capacity > max) {
            return Err(Error::InvalidCapacity {
                capacity,
                max: max_group_size,
            });
        }
        Ok(())
    }

    /// Options handed to every stream connection
    #[must_use]
    pub fn connection_options(&self) -> Arc<ConnectionOptions> {
        Arc::new(ConnectionOptions {
            setup_timeout: self.setup_timeout,
            idle_timeout: self.idle_timeout,
            read_chunk_size: self.read_chunk_size,
            max_frame_len: self.max_frame_len,
            max_pending_frames: self.max_pending_frames,
            control_prefixes: self.control_prefixes.clone(),
        })
    }
}

/// Exponential backoff between retries
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Delay before the first delayed retry
    #[serde(with = "crate::serde_duration")]
    pub initial: Duration,
    /// Upper bound on any delay
    #[serde(with = "crate::serde_duration")]
    pub max: Duration,
    /// Consecutive failures of a group after which it is left failed
    pub retry_limit: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(300),
            retry_limit: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt`, counting from 1
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }
}
