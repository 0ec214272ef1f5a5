//! Protocol messages
//!
//! The dispatch exchange is strictly request/response per worker:
//! `Ready` -> `BatchLen` -> (`TaskBatch` when the length is non-zero).
//! The remaining messages support the process group itself: the connection
//! handshake, the end-of-job barrier and the cooperative abort.

use crate::codec::ProtoError;
use bytes::{Bytes, BytesMut};
use prost::Message as _;

/// Connection handshake, sent once by a worker after connecting to rank 0
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
}

/// Worker announces it is ready for its next batch
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ready {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
}

/// Length of the batch about to follow; zero means the worker is finished
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchLen {
    #[prost(uint32, tag = "1")]
    pub len: u32,
}

/// The task indices of one batch
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskBatch {
    #[prost(uint32, repeated, tag = "1")]
    pub indices: Vec<u32>,
}

/// A rank has reached the end-of-job barrier
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BarrierEnter {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
}

/// Rank 0 releases every rank from the barrier
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BarrierRelease {}

/// Whole-group abort signal
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Abort {
    #[prost(uint32, tag = "1")]
    pub rank: u32,

    #[prost(int32, tag = "2")]
    pub code: i32,

    #[prost(string, tag = "3")]
    pub reason: String,
}

/// Frame tag, one per message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tag {
    Hello = 1,
    Ready = 2,
    BatchLen = 3,
    Batch = 4,
    Barrier = 5,
    Release = 6,
    Abort = 7,
}

impl Tag {
    /// Every tag, in wire order
    pub const ALL: [Tag; 7] = [
        Tag::Hello,
        Tag::Ready,
        Tag::BatchLen,
        Tag::Batch,
        Tag::Barrier,
        Tag::Release,
        Tag::Abort,
    ];
}

impl TryFrom<u8> for Tag {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Tag::ALL
            .into_iter()
            .find(|tag| *tag as u8 == value)
            .ok_or(ProtoError::UnknownTag(value))
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::Hello => write!(f, "HELLO"),
            Tag::Ready => write!(f, "READY"),
            Tag::BatchLen => write!(f, "BATCH_LEN"),
            Tag::Batch => write!(f, "BATCH"),
            Tag::Barrier => write!(f, "BARRIER"),
            Tag::Release => write!(f, "RELEASE"),
            Tag::Abort => write!(f, "ABORT"),
        }
    }
}

/// Any protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Ready(Ready),
    BatchLen(BatchLen),
    Batch(TaskBatch),
    Barrier(BarrierEnter),
    Release(BarrierRelease),
    Abort(Abort),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Hello(_) => Tag::Hello,
            Message::Ready(_) => Tag::Ready,
            Message::BatchLen(_) => Tag::BatchLen,
            Message::Batch(_) => Tag::Batch,
            Message::Barrier(_) => Tag::Barrier,
            Message::Release(_) => Tag::Release,
            Message::Abort(_) => Tag::Abort,
        }
    }

    pub fn ready(rank: u32) -> Self {
        Message::Ready(Ready { rank })
    }

    pub fn batch_len(len: u32) -> Self {
        Message::BatchLen(BatchLen { len })
    }

    pub fn batch(indices: Vec<u32>) -> Self {
        Message::Batch(TaskBatch { indices })
    }

    /// Size of the encoded payload, excluding the frame header
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Hello(m) => m.encoded_len(),
            Message::Ready(m) => m.encoded_len(),
            Message::BatchLen(m) => m.encoded_len(),
            Message::Batch(m) => m.encoded_len(),
            Message::Barrier(m) => m.encoded_len(),
            Message::Release(m) => m.encoded_len(),
            Message::Abort(m) => m.encoded_len(),
        }
    }

    /// Append the protobuf payload to `buf`
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        match self {
            Message::Hello(m) => m.encode(buf),
            Message::Ready(m) => m.encode(buf),
            Message::BatchLen(m) => m.encode(buf),
            Message::Batch(m) => m.encode(buf),
            Message::Barrier(m) => m.encode(buf),
            Message::Release(m) => m.encode(buf),
            Message::Abort(m) => m.encode(buf),
        }
        .map_err(ProtoError::Encode)
    }

    /// Decode a payload previously written for `tag`
    pub fn decode_payload(tag: Tag, payload: Bytes) -> Result<Self, ProtoError> {
        let message = match tag {
            Tag::Hello => Message::Hello(Hello::decode(payload)?),
            Tag::Ready => Message::Ready(Ready::decode(payload)?),
            Tag::BatchLen => Message::BatchLen(BatchLen::decode(payload)?),
            Tag::Batch => Message::Batch(TaskBatch::decode(payload)?),
            Tag::Barrier => Message::Barrier(BarrierEnter::decode(payload)?),
            Tag::Release => Message::Release(BarrierRelease::decode(payload)?),
            Tag::Abort => Message::Abort(Abort::decode(payload)?),
        };
        Ok(message)
    }
}

/// A message together with the rank that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: u32, message: Message) -> Self {
        Self { source, message }
    }

    pub fn tag(&self) -> Tag {
        self.message.tag()
    }
}
