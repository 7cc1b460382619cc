//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so extracted frames share the read buffer.
//! State machine:
//! - `WaitingForLength`: need the 4-byte length prefix
//! - `WaitingForFrame`: length known, need the rest of the frame
//!
//! # Example
//!
//! ```
//! use rsocket_mux::protocol::{Frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = Frame::cancel(1).encode();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::BytesMut;

use super::frame::{peek_frame_size, Frame};
use super::wire_format::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, LENGTH_FIELD_SIZE};
use crate::error::DecodeError;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForFrame { total: usize },
}

/// Accumulates incoming bytes and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Frame buffer with 64KB initial capacity and the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push, so this never reports
    /// `Truncated`.
    ///
    /// # Errors
    ///
    /// `Malformed` if a frame is oversized or fails validation. The buffer
    /// is unusable afterwards; the connection should be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    let total = match peek_frame_size(&self.buffer) {
                        Some(total) => total,
                        None => return Ok(None),
                    };
                    let length = total - LENGTH_FIELD_SIZE;
                    if length < FRAME_HEADER_SIZE {
                        return Err(DecodeError::malformed(format!(
                            "frame length {} shorter than header",
                            length
                        )));
                    }
                    if length > self.max_frame_size as usize {
                        return Err(DecodeError::malformed(format!(
                            "frame size {} exceeds maximum {}",
                            length, self.max_frame_size
                        )));
                    }
                    self.state = State::WaitingForFrame { total };
                }
                State::WaitingForFrame { total } => {
                    if self.buffer.len() < total {
                        return Ok(None);
                    }
                    let bytes = self.buffer.split_to(total).freeze();
                    self.state = State::WaitingForLength;
                    return Frame::parse(bytes, self.max_frame_size).map(Some);
                }
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::protocol::{FrameType, HEADER_SIZE};

    fn next_bytes(stream_id: u32, data: &'static str) -> Vec<u8> {
        Frame::next(stream_id, Payload::from(data), false)
            .encode()
            .to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&next_bytes(1, "hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 1);
        assert_eq!(&frames[0].data[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = next_bytes(1, "first");
        combined.extend_from_slice(&Frame::request_n(3, 4).encode());
        combined.extend_from_slice(&Frame::cancel(5).encode());

        let frames = buffer.push(&combined).unwrap();

        let types: Vec<_> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(
            types,
            vec![FrameType::Payload, FrameType::RequestN, FrameType::Cancel]
        );
        assert_eq!(frames[1].request_n, 4);
    }

    #[test]
    fn test_fragmented_length_prefix() {
        let mut buffer = FrameBuffer::new();
        let bytes = next_bytes(7, "test");

        assert!(buffer.push(&bytes[..2]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForLength");

        let frames = buffer.push(&bytes[2..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 7);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let bytes = next_bytes(1, "this is a longer payload that will be fragmented");

        let split = HEADER_SIZE + 5;
        assert!(buffer.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        let frames = buffer.push(&bytes[split..]).unwrap();
        assert_eq!(
            &frames[0].data[..],
            b"this is a longer payload that will be fragmented"
        );
    }

    #[test]
    fn test_oversized_frame_rejected_before_body() {
        let mut buffer = FrameBuffer::with_max_frame(100);
        let err = buffer.push(&1000u32.to_be_bytes()).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_malformed_frame_surfaces() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = Frame::cancel(1).encode().to_vec();
        bytes[8] = 0x3E;

        let err = buffer.push(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = next_bytes(1, "test");
        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForFrame");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForLength");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = next_bytes(1, "hi");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].data[..], b"hi");
    }
}
