//! Keeps a changing set of subjects covered by long-lived stream connections.
//!
//! The [`Monitor`] partitions the monitored set with [`allocate`], opens one
//! [`StreamConnection`](shardline_stream::StreamConnection) per group and
//! replaces the whole [`ConnectionSet`] whenever the partition changes. A
//! replacement set holds its frames back until every one of its connections
//! has been active for the grace interval; only then does it go live and the
//! old connections drain and close. Messages may be delivered twice around a
//! swap, never lost.
//!
//! Failed connections are repaired individually, with exponential backoff on
//! repeated failures.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod allocator;
mod config;
mod connection_set;
mod error;
mod monitor;
mod serde_duration;
mod status;
mod worker;

pub use allocator::allocate;
pub use config::{BackoffConfig, MonitorConfig};
pub use connection_set::ConnectionSet;
pub use error::{Error, Result};
pub use monitor::Monitor;
pub use serde_duration::{format_duration, parse_duration};
pub use status::MonitorStatus;
