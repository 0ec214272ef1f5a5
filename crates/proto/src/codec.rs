//! Length-prefixed frame codec
//!
//! Frame layout (big endian):
//!
//! ```text
//! +-----------+--------+--------------+------------------+
//! | len: u32  | tag:u8 | source: u32  | protobuf payload |
//! +-----------+--------+--------------+------------------+
//! ```
//!
//! `len` counts every byte after the length prefix itself.

use crate::messages::{Envelope, Message, Tag};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes of a frame header after the length prefix: tag + source rank
const HEADER_LEN: usize = 1 + 4;

/// Bytes of the length prefix
const PREFIX_LEN: usize = 4;

/// Default ceiling on a single frame (64 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Tag byte that names no message
    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    /// Frame shorter than its own header
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame longer than the configured maximum
    #[error("Frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Payload could not be encoded
    #[error("Encode error: {0}")]
    Encode(prost::EncodeError),

    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec turning byte streams into [`Envelope`]s and back
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// `max_frame_bytes` is capped at what the `u32` length prefix can carry
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = HEADER_LEN + item.message.encoded_len();
        if len > self.max_frame_bytes {
            return Err(ProtoError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(PREFIX_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u8(item.tag() as u8);
        dst.put_u32(item.source);
        item.message.encode_payload(dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&src[..PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_bytes {
            return Err(ProtoError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if len < HEADER_LEN {
            return Err(ProtoError::Malformed(format!(
                "frame length {} is shorter than the {} byte header",
                len, HEADER_LEN
            )));
        }

        if src.len() < PREFIX_LEN + len {
            src.reserve(PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let mut frame = src.split_to(len);
        let tag = Tag::try_from(frame.get_u8())?;
        let source = frame.get_u32();
        let message = Message::decode_payload(tag, frame.freeze())?;

        Ok(Some(Envelope::new(source, message)))
    }
}
