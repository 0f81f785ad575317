//! Long-lived stream connections for a group of subjects.
//!
//! A [`StreamConnection`] opens one transport connection for its group, reads
//! the body in bounded increments, splits it into CRLF delimited frames and
//! hands every complete frame to a [`Decoder`]. Its owner steers it with
//! directives: hold frames back, forward them, drain, or close.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod decoder;
mod error;
mod framing;
mod state;

pub use connection::{
    ConnectionOptions, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_PENDING_FRAMES, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_SETUP_TIMEOUT, Directive, StreamConnection,
};
pub use decoder::{ChannelDecoder, Decoder, ReceiverDropped};
pub use error::{Error, ErrorKind, FrameError};
pub use framing::{
    DEFAULT_CONTROL_PREFIX, DELIMITER, Frame, FrameClassifier, FrameCodec, FrameKind, MAX_FRAME_LEN,
};
pub use state::{ConnectionEvent, ConnectionId, ConnectionState, ConnectionStatus};

/// A type alias for `Result<T, Error>`
pub type Result<T> = std::result::Result<T, Error>;
