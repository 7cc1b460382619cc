//! Wire format constants and the fixed frame header.
//!
//! Every frame starts with a 10-byte header:
//! ```text
//! ┌──────────┬───────────┬──────┬───────┐
//! │ Length   │ Stream ID │ Type │ Flags │
//! │ 4 bytes  │ 4 bytes   │ 1    │ 1     │
//! │ uint32 BE│ uint32 BE │      │       │
//! └──────────┴───────────┴──────┴───────┘
//! ```
//!
//! `Length` counts the bytes that follow the length field itself.
//! All multi-byte integers are Big Endian.

use crate::error::DecodeError;

/// Size of the length prefix.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Header size in bytes, length prefix included (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Header bytes counted by the length field (stream id + type + flags).
pub const FRAME_HEADER_SIZE: usize = HEADER_SIZE - LENGTH_FIELD_SIZE;

/// Size of the metadata length field (uint24).
pub const METADATA_LENGTH_SIZE: usize = 3;

/// Largest metadata block a frame can carry.
pub const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;

/// Default maximum frame length (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Highest stream id (ids are 31-bit).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Request-n value meaning "unbounded".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Stream id of connection-level frames.
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Protocol version carried in SETUP.
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    Complete = 0x0F,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => FrameType::Setup,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0F => FrameType::Complete,
            _ => return None,
        })
    }

    /// One of the four REQUEST_* frames that open a stream.
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Frames that only ever travel on stream 0.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        matches!(self, FrameType::Setup | FrameType::Keepalive)
    }

    /// Frames that carry a request-n field after the header.
    #[inline]
    pub fn has_request_n(self) -> bool {
        matches!(
            self,
            FrameType::RequestStream | FrameType::RequestChannel | FrameType::RequestN
        )
    }

    /// Frames allowed to set METADATA_PRESENT.
    #[inline]
    pub fn can_have_metadata(self) -> bool {
        self.is_request() || matches!(self, FrameType::Payload | FrameType::Setup)
    }

    /// Frames allowed to be split with FOLLOWS.
    #[inline]
    pub fn can_fragment(self) -> bool {
        self.is_request() || self == FrameType::Payload
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Setup => "SETUP",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::Complete => "COMPLETE",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Metadata block present.
    pub const METADATA_PRESENT: u8 = 0b0000_0001;
    /// More fragments of this frame follow.
    pub const FOLLOWS: u8 = 0b0000_0010;
    /// Stream completion (PAYLOAD, REQUEST_CHANNEL).
    pub const COMPLETE: u8 = 0b0000_0100;
    /// PAYLOAD carries a value.
    pub const NEXT: u8 = 0b0000_1000;
    /// KEEPALIVE asks the peer to answer.
    pub const RESPOND: u8 = 0b0001_0000;

    /// Reserved bits mask (bits 5-7).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Value + completion in one frame.
    pub const NEXT_COMPLETE: u8 = NEXT | COMPLETE;
}

/// Error codes carried by ERROR frames.
pub mod error_code {
    pub const INVALID_SETUP: u32 = 0x001;
    pub const UNSUPPORTED_SETUP: u32 = 0x002;
    pub const REJECTED_SETUP: u32 = 0x003;
    pub const CONNECTION_ERROR: u32 = 0x101;
    pub const CONNECTION_CLOSE: u32 = 0x102;
    pub const APPLICATION_ERROR: u32 = 0x201;
    pub const REJECTED: u32 = 0x202;
    pub const CANCELED: u32 = 0x203;
    pub const INVALID: u32 = 0x204;
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Bytes following the length field.
    pub length: u32,
    /// Stream identifier (0 = connection).
    pub stream_id: u32,
    /// Raw frame type byte (see [`FrameType`]).
    pub frame_type: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
}

impl Header {
    /// Create a new header.
    pub fn new(length: u32, stream_id: u32, frame_type: FrameType, flags: u8) -> Self {
        Self {
            length,
            stream_id,
            frame_type: frame_type as u8,
            flags,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (10 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8] = self.frame_type;
        buf[9] = self.flags;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            frame_type: buf[8],
            flags: buf[9],
        })
    }

    /// Total encoded size of the frame this header describes.
    #[inline]
    pub fn frame_size(&self) -> usize {
        LENGTH_FIELD_SIZE + self.length as usize
    }

    /// Validate the header for protocol compliance and resolve its type.
    ///
    /// Checks:
    /// - Length covers at least the fixed header
    /// - Length doesn't exceed max
    /// - Type is known
    /// - Reserved flag bits are 0
    /// - Stream id is 31-bit and matches the frame's level
    /// - METADATA_PRESENT only on frames that may carry metadata
    pub fn validate(&self, max_frame_size: u32) -> Result<FrameType, DecodeError> {
        if (self.length as usize) < FRAME_HEADER_SIZE {
            return Err(DecodeError::malformed(format!(
                "frame length {} shorter than header",
                self.length
            )));
        }

        if self.length > max_frame_size {
            return Err(DecodeError::malformed(format!(
                "frame size {} exceeds maximum {}",
                self.length, max_frame_size
            )));
        }

        let frame_type = FrameType::from_u8(self.frame_type).ok_or_else(|| {
            DecodeError::malformed(format!("unknown frame type 0x{:02X}", self.frame_type))
        })?;

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(DecodeError::malformed("reserved flag bits must be 0"));
        }

        if self.stream_id > MAX_STREAM_ID {
            return Err(DecodeError::malformed(format!(
                "stream id {} exceeds 31 bits",
                self.stream_id
            )));
        }

        let on_connection = self.stream_id == CONNECTION_STREAM_ID;
        if frame_type.is_connection_level() && !on_connection {
            return Err(DecodeError::malformed(format!(
                "{} on stream {}",
                frame_type, self.stream_id
            )));
        }
        if on_connection && !frame_type.is_connection_level() && frame_type != FrameType::Error {
            return Err(DecodeError::malformed(format!("{} on stream 0", frame_type)));
        }

        if flags::has_flag(self.flags, flags::METADATA_PRESENT) && !frame_type.can_have_metadata()
        {
            return Err(DecodeError::malformed(format!(
                "METADATA_PRESENT set on {}",
                frame_type
            )));
        }

        if flags::has_flag(self.flags, flags::FOLLOWS) && !frame_type.can_fragment() {
            return Err(DecodeError::malformed(format!("FOLLOWS set on {}", frame_type)));
        }

        Ok(frame_type)
    }
}
