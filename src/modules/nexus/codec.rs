//! Nexus Frame Codec
//!
//! Every Nexus message on the wire is framed as
//!
//! ```text
//! type (1 byte) | length (2 bytes BE, or 4 bytes BE for type 205) | payload
//! ```
//!
//! [`FrameDecoder`] reassembles frames from a socket byte stream that arrives
//! in arbitrary chunk boundaries. [`encode_frame`] produces the same framing
//! for outgoing messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Header size for frames with a 16-bit length field
pub const SHORT_HEADER_SIZE: usize = 3;

/// Header size for frames with a 32-bit length field
pub const LONG_HEADER_SIZE: usize = 5;

/// Known Nexus message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Hello,
    StartPlayback,
    Ok,
    Error,
    PlaybackBegin,
    PlaybackEnd,
    PlaybackPacket,
    LongPlaybackPacket,
    ClockSync,
    Redirect,
    /// Undocumented type, kept for logging
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(value: u8) -> MessageType {
        match value {
            1 => MessageType::Ping,
            100 => MessageType::Hello,
            103 => MessageType::StartPlayback,
            200 => MessageType::Ok,
            201 => MessageType::Error,
            202 => MessageType::PlaybackBegin,
            203 => MessageType::PlaybackEnd,
            204 => MessageType::PlaybackPacket,
            205 => MessageType::LongPlaybackPacket,
            206 => MessageType::ClockSync,
            207 => MessageType::Redirect,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Ping => 1,
            MessageType::Hello => 100,
            MessageType::StartPlayback => 103,
            MessageType::Ok => 200,
            MessageType::Error => 201,
            MessageType::PlaybackBegin => 202,
            MessageType::PlaybackEnd => 203,
            MessageType::PlaybackPacket => 204,
            MessageType::LongPlaybackPacket => 205,
            MessageType::ClockSync => 206,
            MessageType::Redirect => 207,
            MessageType::Unknown(value) => value,
        }
    }

    /// Only long playback packets carry a 32-bit length.
    pub fn has_long_length(self) -> bool {
        self == MessageType::LongPlaybackPacket
    }

    pub fn header_size(self) -> usize {
        if self.has_long_length() {
            LONG_HEADER_SIZE
        } else {
            SHORT_HEADER_SIZE
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ping => write!(f, "Ping"),
            MessageType::Hello => write!(f, "Hello"),
            MessageType::StartPlayback => write!(f, "StartPlayback"),
            MessageType::Ok => write!(f, "OK"),
            MessageType::Error => write!(f, "Error"),
            MessageType::PlaybackBegin => write!(f, "PlaybackBegin"),
            MessageType::PlaybackEnd => write!(f, "PlaybackEnd"),
            MessageType::PlaybackPacket => write!(f, "PlaybackPacket"),
            MessageType::LongPlaybackPacket => write!(f, "LongPlaybackPacket"),
            MessageType::ClockSync => write!(f, "ClockSync"),
            MessageType::Redirect => write!(f, "Redirect"),
            MessageType::Unknown(value) => write!(f, "Unknown({})", value),
        }
    }
}

/// A complete Nexus frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Frame {
            message_type,
            payload: payload.into(),
        }
    }
}

/// Frame encoding error
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Payload does not fit in the length field selected by the message type
    PayloadTooLarge {
        message_type: MessageType,
        length: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::PayloadTooLarge {
                message_type,
                length,
            } => write!(
                f,
                "Payload of {} bytes too large for {} frame",
                length, message_type
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode a single frame
pub fn encode_frame(message_type: MessageType, payload: &[u8]) -> Result<Bytes, CodecError> {
    let too_large = || CodecError::PayloadTooLarge {
        message_type,
        length: payload.len(),
    };

    let mut buf = BytesMut::with_capacity(message_type.header_size() + payload.len());
    buf.put_u8(message_type.as_u8());
    if message_type.has_long_length() {
        let length = u32::try_from(payload.len()).map_err(|_| too_large())?;
        buf.put_u32(length);
    } else {
        let length = u16::try_from(payload.len()).map_err(|_| too_large())?;
        buf.put_u16(length);
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame reassembler
///
/// Bytes that do not yet form a complete frame are carried over to the next
/// call to [`FrameDecoder::feed`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over every frame it completes.
    ///
    /// The iterator must be drained for all complete frames to be consumed;
    /// anything left undrained stays buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { decoder: self }
    }

    /// Number of buffered bytes that do not yet form a frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame, e.g. when the socket is replaced
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let type_byte = *self.buffer.first()?;
        let message_type = MessageType::from_u8(type_byte);
        let header_size = message_type.header_size();
        if self.buffer.len() < header_size {
            return None;
        }

        let length = if message_type.has_long_length() {
            u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize
        } else {
            u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize
        };

        if self.buffer.len() < header_size + length {
            return None;
        }

        self.buffer.advance(header_size);
        let payload = self.buffer.split_to(length).freeze();
        Some(Frame {
            message_type,
            payload,
        })
    }
}

/// Iterator over the frames completed by one [`FrameDecoder::feed`] call
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.decoder.next_frame()
    }
}
