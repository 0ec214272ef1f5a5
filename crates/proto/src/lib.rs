//! BatchDispatch wire protocol
//!
//! Message definitions exchanged between the dispatcher (rank 0) and remote
//! workers, plus the length-prefixed frame codec that carries them over a
//! byte stream. Messages are protobuf-encoded with `prost` derives; every frame
//! carries a distinct tag so a `BATCH_LEN` can never be mistaken for a `READY`.

pub mod codec;
pub mod messages;

pub use codec::{FrameCodec, ProtoError, DEFAULT_MAX_FRAME_BYTES};
pub use messages::{
    Abort, BarrierEnter, BarrierRelease, BatchLen, Envelope, Hello, Message, Ready, Tag,
    TaskBatch,
};
