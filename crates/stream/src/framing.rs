//! CRLF message framing for the stream body.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FrameError;

/// Delimiter terminating every frame.
pub const DELIMITER: &[u8] = b"\r\n";

/// Maximum frame size (1MB by default).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prefix marking control frames by default.
pub const DEFAULT_CONTROL_PREFIX: &str = "{\"control\"";

/// Kind of a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Stream management message from the remote endpoint.
    Control,
    /// Ordinary message about a subject.
    Data,
}

/// A complete, non-blank message read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Kind of this frame.
    pub kind: FrameKind,
    /// Frame contents without the delimiter.
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    /// Create a control frame.
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Control,
            payload: payload.into(),
        }
    }
}

/// Codec splitting a byte stream on CRLF.
///
/// Bytes arrive in arbitrary increments; a partial frame stays in the buffer
/// until its delimiter shows up. The codec remembers how far it already
/// scanned so each byte is inspected once.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    next_index: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
            next_index: 0,
        }
    }

    /// Create a codec with custom max frame length.
    #[must_use]
    pub const fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Maximum frame length accepted, delimiter excluded.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A '\r' at the end of the previous scan may pair with a new '\n'
        let start = self.next_index.min(buf.len());
        let found = buf[start..]
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER)
            .map(|offset| start + offset);

        let Some(end) = found else {
            if buf.len() > self.max_frame_len + 1 {
                return Err(FrameError::TooLong {
                    max: self.max_frame_len,
                });
            }
            self.next_index = buf.len().saturating_sub(DELIMITER.len() - 1);
            return Ok(None);
        };

        self.next_index = 0;

        if end > self.max_frame_len {
            return Err(FrameError::TooLong {
                max: self.max_frame_len,
            });
        }

        let payload = buf.split_to(end).freeze();
        buf.advance(DELIMITER.len());
        Ok(Some(payload))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.iter().all(u8::is_ascii_whitespace) => {
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }
            None => Err(FrameError::Truncated { len: buf.len() }),
        }
    }
}

/// Sorts raw frames into heartbeats, control frames and data frames.
#[derive(Debug, Clone)]
pub struct FrameClassifier {
    control_prefixes: Vec<Bytes>,
}

impl FrameClassifier {
    /// Create a classifier recognizing the given control prefixes.
    pub fn new<I, P>(control_prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self {
            control_prefixes: control_prefixes
                .into_iter()
                .map(|prefix| Bytes::copy_from_slice(prefix.as_ref().as_bytes()))
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    /// Classify a raw frame.
    ///
    /// Returns `None` for blank frames, which are keep-alive heartbeats and
    /// never reach the decoder.
    #[must_use]
    pub fn classify(&self, payload: Bytes) -> Option<Frame> {
        let trimmed = payload.trim_ascii_start();
        if trimmed.is_empty() {
            return None;
        }

        let kind = if self
            .control_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
        {
            FrameKind::Control
        } else {
            FrameKind::Data
        };

        Some(Frame { kind, payload })
    }
}

impl Default for FrameClassifier {
    fn default() -> Self {
        Self::new([DEFAULT_CONTROL_PREFIX])
    }
}
