//! Wire protocol: the SMTP vocabulary used by the disguise handshake and the
//! binary frames exchanged after it.

pub mod frames;
pub mod smtp;

pub use frames::{
    decode, encode, Decoded, Frame, FrameCodec, FrameError, FrameType, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
