use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size (64KB - 1, the largest value the length field holds)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Frame header size: type(1) + channel_id(2) + length(2)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Longest host name a CONNECT payload can carry (1-byte length prefix)
pub const MAX_HOST_LEN: usize = 255;

/// Frame types for binary protocol
///
/// Values this build does not know decode as `Unknown` so that newer peers can
/// add frame types without breaking the stream; the dispatcher ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Tunnel data
    Data,
    /// Open new channel
    Connect,
    /// Connection successful
    ConnectOk,
    /// Connection failed
    ConnectFail,
    /// Close channel
    Close,
    /// Anything else
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Data,
            0x02 => Self::Connect,
            0x03 => Self::ConnectOk,
            0x04 => Self::ConnectFail,
            0x05 => Self::Close,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x01,
            Self::Connect => 0x02,
            Self::ConnectOk => 0x03,
            Self::ConnectFail => 0x04,
            Self::Close => 0x05,
            Self::Unknown(other) => other,
        }
    }
}

/// Binary protocol frame
/// Wire format: type(1) + channel_id(2) + length(2) + payload(N)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel_id: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, channel_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            channel_id,
            payload: payload.into(),
        }
    }

    /// Create a DATA frame
    pub fn data(channel_id: u16, data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, channel_id, data)
    }

    /// Create a CONNECT frame
    pub fn connect(channel_id: u16, host: &str, port: u16) -> Result<Self, FrameError> {
        let host_bytes = host.as_bytes();
        if host_bytes.is_empty() {
            return Err(FrameError::Malformed("empty CONNECT host".into()));
        }
        if host_bytes.len() > MAX_HOST_LEN {
            return Err(FrameError::PayloadTooLarge(host_bytes.len()));
        }
        let mut payload = BytesMut::with_capacity(1 + host_bytes.len() + 2);
        payload.put_u8(host_bytes.len() as u8);
        payload.extend_from_slice(host_bytes);
        payload.put_u16(port);
        Ok(Self::new(FrameType::Connect, channel_id, payload.freeze()))
    }

    /// Create a CONNECT_OK frame
    pub fn connect_ok(channel_id: u16) -> Self {
        Self::new(FrameType::ConnectOk, channel_id, Bytes::new())
    }

    /// Create a CONNECT_FAIL frame
    pub fn connect_fail(channel_id: u16) -> Self {
        Self::new(FrameType::ConnectFail, channel_id, Bytes::new())
    }

    /// Create a CLOSE frame
    pub fn close(channel_id: u16) -> Self {
        Self::new(FrameType::Close, channel_id, Bytes::new())
    }

    /// Append the wire form of this frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        dst.reserve(FRAME_HEADER_SIZE + self.payload.len());
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u16(self.channel_id);
        dst.put_u16(self.payload.len() as u16);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Serialize frame to bytes
    pub fn serialize(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse a CONNECT payload to extract host and port
    pub fn parse_connect(&self) -> Result<(String, u16), FrameError> {
        if self.frame_type != FrameType::Connect {
            return Err(FrameError::Malformed(format!(
                "expected CONNECT, got {:?}",
                self.frame_type
            )));
        }
        let mut buf = &self.payload[..];
        if buf.remaining() < 1 {
            return Err(FrameError::Malformed("empty CONNECT payload".into()));
        }
        let host_len = buf.get_u8() as usize;
        if host_len == 0 || buf.remaining() < host_len + 2 {
            return Err(FrameError::Malformed(format!(
                "CONNECT payload of {} bytes cannot hold a {host_len}-byte host",
                self.payload.len()
            )));
        }
        let host = std::str::from_utf8(&buf[..host_len])
            .map_err(|_| FrameError::Malformed("CONNECT host is not UTF-8".into()))?
            .to_string();
        buf.advance(host_len);
        let port = buf.get_u16();
        Ok((host, port))
    }
}

/// Frame parsing error
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Outcome of [`decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied
    Frame(Frame, usize),
    /// More bytes are needed; keep the buffer and append the next read
    Incomplete,
}

/// Encode one frame, `5 + payload.len()` bytes
pub fn encode(frame_type: FrameType, channel_id: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    Frame::new(frame_type, channel_id, Bytes::copy_from_slice(payload)).serialize()
}

/// Decode the first frame in `buf` without consuming anything
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < FRAME_HEADER_SIZE {
        return Decoded::Incomplete;
    }
    let payload_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total_len = FRAME_HEADER_SIZE + payload_len;
    if buf.len() < total_len {
        return Decoded::Incomplete;
    }
    let frame = Frame {
        frame_type: FrameType::from_u8(buf[0]),
        channel_id: u16::from_be_bytes([buf[1], buf[2]]),
        payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total_len]),
    };
    Decoded::Frame(frame, total_len)
}

/// Tokio codec for encoding/decoding frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Reject frames declaring more than `max_payload` bytes
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u16::from_be_bytes([src[3], src[4]]) as usize;
        if payload_len > self.max_payload {
            return Err(FrameError::Malformed(format!(
                "declared length {payload_len} exceeds limit {}",
                self.max_payload
            )));
        }

        // Check if we have complete frame
        let total_len = FRAME_HEADER_SIZE + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(total_len);
        let frame_type = FrameType::from_u8(buf.get_u8());
        let channel_id = buf.get_u16();
        buf.advance(2); // length, already known
        let payload = buf.freeze();

        Ok(Some(Frame {
            frame_type,
            channel_id,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Malformed(format!(
                "stream ended inside a frame ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}
