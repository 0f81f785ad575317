//! The decoding capability frames are handed to

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::framing::Frame;
use crate::state::ConnectionId;

/// Consumer of complete frames
///
/// Frames from one connection arrive in stream order; frames from different
/// connections may interleave. During a consolidation the same message may be
/// delivered twice, once by the outgoing and once by the incoming connection.
///
/// A connection waits for `on_frame` to return before reading further, so a
/// slow decoder throttles its connections.
#[async_trait]
pub trait Decoder: Clone + Send + Sync + 'static {
    /// Error returned by the decoder
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handle one frame read by `connection`
    ///
    /// # Errors
    ///
    /// Errors are logged by the connection and never end it.
    async fn on_frame(&self, connection: ConnectionId, frame: Frame) -> Result<(), Self::Error>;
}

/// Error returned when the receiving end of a [`ChannelDecoder`] is gone
#[derive(Debug, thiserror::Error)]
#[error("Frame receiver dropped")]
pub struct ReceiverDropped;

/// Decoder forwarding every frame into a bounded channel
#[derive(Clone, Debug)]
pub struct ChannelDecoder {
    sender: mpsc::Sender<(ConnectionId, Frame)>,
}

impl ChannelDecoder {
    /// Create a decoder and the receiver its frames go to
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(ConnectionId, Frame)>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Decoder for ChannelDecoder {
    type Error = ReceiverDropped;

    async fn on_frame(&self, connection: ConnectionId, frame: Frame) -> Result<(), Self::Error> {
        self.sender
            .send((connection, frame))
            .await
            .map_err(|_| ReceiverDropped)
    }
}
