//! JSON decoder for stream frames
//!
//! Every frame is parsed as one JSON document. Messages addressed to a
//! followed subject (`for_user` plus `message.text`) are surfaced as
//! [`StreamMessage::Message`]; control frames and any other document are
//! passed through as parsed JSON. Decoded messages go to a bounded channel, so
//! a slow consumer throttles the connections feeding it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use shardline_stream::{ConnectionId, Decoder, Frame, FrameKind};
use shardline_subjects::SubjectId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors produced while decoding a frame
#[derive(Debug, Error)]
pub enum Error {
    /// The frame is not valid JSON
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Nobody is receiving decoded messages any more
    #[error("Message receiver dropped")]
    ReceiverDropped,
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    /// A message delivered on behalf of a followed subject
    Message {
        /// The subject the message is for
        for_user: SubjectId,
        /// Message text
        text: String,
        /// The whole document
        raw: Value,
    },

    /// A control frame
    Control(Value),

    /// Any other document
    Other(Value),
}

#[derive(Deserialize)]
struct Addressed {
    for_user: u64,
    message: Body,
}

#[derive(Deserialize)]
struct Body {
    text: String,
}

impl StreamMessage {
    /// Decode one frame
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        let raw: Value = serde_json::from_slice(&frame.payload)?;

        if frame.kind == FrameKind::Control {
            return Ok(Self::Control(raw));
        }

        match Addressed::deserialize(&raw) {
            Ok(Addressed { for_user, message }) => Ok(Self::Message {
                for_user: SubjectId::new(for_user),
                text: message.text,
                raw,
            }),
            Err(_) => Ok(Self::Other(raw)),
        }
    }
}

/// Decoder parsing frames as JSON into a bounded channel
#[derive(Clone, Debug)]
pub struct JsonDecoder {
    sender: mpsc::Sender<(ConnectionId, StreamMessage)>,
}

impl JsonDecoder {
    /// Create a decoder and the receiver its messages go to
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(ConnectionId, StreamMessage)>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Decoder for JsonDecoder {
    type Error = Error;

    async fn on_frame(&self, connection: ConnectionId, frame: Frame) -> Result<(), Self::Error> {
        let message = StreamMessage::decode(&frame)?;
        trace!(%connection, ?message, "Decoded frame");

        self.sender
            .send((connection, message))
            .await
            .map_err(|_| Error::ReceiverDropped)
    }
}
