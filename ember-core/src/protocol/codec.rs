//! Codec implementation for framing the binary key-value protocol.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::frame::{Frame, FrameHeader};
use crate::error::{EmberError, Result};

/// Codec for encoding and decoding protocol frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. A body larger than `max_body_size` is treated as
/// stream corruption and fails the decoder; the caller must drop the
/// connection afterwards.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body_size: usize,
}

impl FrameCodec {
    /// Creates a codec with the default body size limit.
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    /// Creates a codec with a custom body size limit.
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        Self { max_body_size }
    }

    /// Returns the configured body size limit.
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = EmberError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.body_len() > self.max_body_size {
            return Err(EmberError::InvalidArgument(format!(
                "frame body of {} bytes exceeds limit of {} bytes",
                item.body_len(),
                self.max_body_size
            )));
        }
        item.write_to(dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = EmberError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match FrameHeader::parse(src)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.body_len as usize > self.max_body_size {
            return Err(EmberError::Protocol(format!(
                "frame body of {} bytes exceeds limit of {} bytes",
                header.body_len, self.max_body_size
            )));
        }

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Frame::read_from(src)
    }
}
