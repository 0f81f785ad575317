//! Transport abstraction for long-lived streaming connections
//!
//! This crate provides a transport-agnostic interface for opening one streaming
//! connection per group of subjects and reading its raw bytes incrementally.
//! Specific transport implementations (HTTP, in-memory, etc.) are provided in
//! separate crates.
//!
//! Transports handle:
//! - Handshake and the authenticated request for a group
//! - Delivery of raw body bytes, in whatever increments the network produces
//! - Releasing network resources on close
//!
//! Framing and decoding of the byte stream are not the transport's concern.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
mod signer;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::BytesMut;
use shardline_subjects::Group;

pub use error::TransportError;
pub use error::TransportError as Error;
pub use signer::{NoopSigner, RequestSigner, StaticHeaderSigner};

/// Transport trait for opening streaming connections
///
/// Implementations are cheap to clone; every clone opens connections against
/// the same endpoint with the same credentials.
#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    /// Open a streaming connection tracking every subject in `group`
    ///
    /// Resolves once the remote endpoint has accepted the request, so a
    /// returned connection is ready to be read from. Authentication problems
    /// are reported as [`TransportError::Auth`].
    async fn open(&self, group: &Group) -> Result<Box<dyn Connection>, TransportError>;

    /// Maximum number of subjects the remote endpoint accepts per connection
    fn max_group_size(&self) -> Option<usize> {
        None
    }
}

/// An open streaming connection
#[async_trait]
pub trait Connection: Debug + Send + 'static {
    /// Append up to `max` bytes of stream data to `buf`
    ///
    /// Waits until at least one byte is available. Returns the number of bytes
    /// appended; `0` means the remote end closed the stream.
    ///
    /// This method must be cancel-safe: if the returned future is dropped
    /// before completion, no stream data may be lost.
    async fn read_some(&mut self, buf: &mut BytesMut, max: usize) -> Result<usize, TransportError>;

    /// Close the connection and release its network resources
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}
