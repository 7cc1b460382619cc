//! Protocol module - wire format, framing, and frame types.
//!
//! - 10-byte header encoding/decoding and frame-level validation
//! - Frame struct with typed constructors and the encode/decode pair
//! - Frame buffer for accumulating partial reads
//! - Fragmentation and reassembly of oversized frames

mod fragment;
mod frame;
mod frame_buffer;
mod wire_format;

pub use fragment::{fragment, Reassembler};
pub use frame::{
    decode, decode_with_limit, encode, encode_route_metadata, split_route_metadata, Frame,
    SetupParams, DEFAULT_DATA_MIME_TYPE, MAX_ROUTE_LENGTH, ROUTING_MIME_TYPE,
};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    error_code, flags, FrameType, Header, CONNECTION_STREAM_ID, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_SIZE, HEADER_SIZE, LENGTH_FIELD_SIZE, MAJOR_VERSION, MAX_METADATA_LENGTH,
    MAX_REQUEST_N, MAX_STREAM_ID, METADATA_LENGTH_SIZE, MINOR_VERSION,
};
