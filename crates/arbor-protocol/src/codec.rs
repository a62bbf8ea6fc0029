//! Codec turning a byte stream into [`Frame`]s and back.
//!
//! The wire format is one JSON object per line, LF-terminated (a trailing CR
//! is tolerated). Decoding enforces a maximum line length so a peer cannot
//! buffer-exhaust the node by never sending a newline.

use crate::frame::Frame;
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default maximum encoded frame length in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Line exceeded the configured maximum before a newline arrived.
    #[error("frame of {length} bytes exceeds maximum {max}")]
    FrameTooLong {
        /// Bytes buffered so far.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Line was not a valid frame; the sender gets one `INVALID_MESSAGE`
    /// and the connection closes.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Newline-delimited JSON codec for [`Frame`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// Create a codec with the given maximum line length.
    #[must_use]
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_length {
                    return Err(CodecError::FrameTooLong {
                        length: src.len(),
                        max: self.max_frame_length,
                    });
                }
                return Ok(None);
            };

            if pos > self.max_frame_length {
                return Err(CodecError::FrameTooLong {
                    length: pos,
                    max: self.max_frame_length,
                });
            }

            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            // Blank keep-alive lines are skipped, not errors.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let frame: Frame = serde_json::from_slice(&line)?;
            trace!(target: "arbor.codec", command = frame.command(), "decoded frame");
            return Ok(Some(frame));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let encoded = serde_json::to_vec(&frame)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}
