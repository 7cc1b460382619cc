//! Frame struct, typed constructors and the encode/decode pair.
//!
//! Uses `bytes::Bytes` so decoded metadata and data share the read buffer.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::protocol::{decode, Frame, FrameType};
//! use rsocket_mux::Payload;
//!
//! let frame = Frame::request_response(1, "greeting", Payload::from("Hello Rsocket!")).unwrap();
//! let bytes = frame.encode();
//!
//! let (decoded, consumed) = decode(&bytes).unwrap();
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(decoded.frame_type, FrameType::RequestResponse);
//! assert_eq!(decoded.route().unwrap().as_deref(), Some("greeting"));
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{
    flags, FrameType, Header, CONNECTION_STREAM_ID, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_SIZE, HEADER_SIZE, LENGTH_FIELD_SIZE, MAJOR_VERSION, MAX_METADATA_LENGTH,
    MAX_REQUEST_N, METADATA_LENGTH_SIZE, MINOR_VERSION,
};
use crate::error::{DecodeError, RSocketError, Result};
use crate::payload::Payload;

/// Longest route key the routing tag can carry.
pub const MAX_ROUTE_LENGTH: usize = 255;

/// Default metadata mime type announced in SETUP.
pub const ROUTING_MIME_TYPE: &str = "message/x.rsocket.routing.v0";

/// Default data mime type announced in SETUP.
pub const DEFAULT_DATA_MIME_TYPE: &str = "application/json";

/// Connection parameters exchanged in SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    pub major_version: u16,
    pub minor_version: u16,
    /// Interval between KEEPALIVE frames sent by the client.
    pub keepalive_interval: Duration,
    /// Silence after which the client gives up on the connection.
    pub max_lifetime: Duration,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
}

impl Default for SetupParams {
    fn default() -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
            metadata_mime_type: ROUTING_MIME_TYPE.to_string(),
            data_mime_type: DEFAULT_DATA_MIME_TYPE.to_string(),
        }
    }
}

impl SetupParams {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u32(duration_millis(self.keepalive_interval));
        buf.put_u32(duration_millis(self.max_lifetime));
        put_short_string(buf, &self.metadata_mime_type);
        put_short_string(buf, &self.data_mime_type);
    }

    fn decode_from(body: &mut Bytes) -> std::result::Result<Self, DecodeError> {
        if body.remaining() < 12 {
            return Err(DecodeError::malformed("SETUP fields truncated"));
        }
        let major_version = body.get_u16();
        let minor_version = body.get_u16();
        let keepalive_interval = Duration::from_millis(body.get_u32() as u64);
        let max_lifetime = Duration::from_millis(body.get_u32() as u64);
        let metadata_mime_type = get_short_string(body)?;
        let data_mime_type = get_short_string(body)?;
        Ok(Self {
            major_version,
            minor_version,
            keepalive_interval,
            max_lifetime,
            metadata_mime_type,
            data_mime_type,
        })
    }
}

fn duration_millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn put_short_string(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&s.as_bytes()[..len]);
}

fn get_short_string(body: &mut Bytes) -> std::result::Result<String, DecodeError> {
    if !body.has_remaining() {
        return Err(DecodeError::malformed("missing mime type length"));
    }
    let len = body.get_u8() as usize;
    if body.remaining() < len {
        return Err(DecodeError::malformed("mime type overruns frame"));
    }
    String::from_utf8(body.split_to(len).to_vec())
        .map_err(|_| DecodeError::malformed("mime type is not UTF-8"))
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: FrameType,
    /// Flags byte. METADATA_PRESENT is derived from `metadata` on encode.
    pub flags: u8,
    /// Request-n for REQUEST_STREAM, REQUEST_CHANNEL and REQUEST_N; 0 otherwise.
    pub request_n: u32,
    /// Error code for ERROR; 0 otherwise.
    pub error_code: u32,
    /// Parameters for SETUP.
    pub setup: Option<SetupParams>,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl Frame {
    /// Bare frame with no type-specific fields.
    pub fn new(stream_id: u32, frame_type: FrameType, flags: u8) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: flags & !flags::METADATA_PRESENT,
            request_n: 0,
            error_code: 0,
            setup: None,
            metadata: None,
            data: Bytes::new(),
        }
    }

    fn with_payload(mut self, payload: Payload) -> Self {
        if payload.metadata.is_some() {
            self.flags |= flags::METADATA_PRESENT;
        }
        self.metadata = payload.metadata;
        self.data = payload.data;
        self
    }

    fn request(
        stream_id: u32,
        frame_type: FrameType,
        frame_flags: u8,
        route: &str,
        payload: Payload,
    ) -> Result<Self> {
        let metadata = encode_route_metadata(route, payload.metadata.as_ref())?;
        Ok(Frame::new(stream_id, frame_type, frame_flags).with_payload(Payload {
            metadata: Some(metadata),
            data: payload.data,
        }))
    }

    pub fn setup(params: SetupParams) -> Self {
        let mut frame = Frame::new(CONNECTION_STREAM_ID, FrameType::Setup, 0);
        frame.setup = Some(params);
        frame
    }

    pub fn keepalive(respond: bool, data: Bytes) -> Self {
        let frame_flags = if respond { flags::RESPOND } else { 0 };
        let mut frame = Frame::new(CONNECTION_STREAM_ID, FrameType::Keepalive, frame_flags);
        frame.data = data;
        frame
    }

    pub fn request_response(stream_id: u32, route: &str, payload: Payload) -> Result<Self> {
        Self::request(stream_id, FrameType::RequestResponse, 0, route, payload)
    }

    pub fn request_fnf(stream_id: u32, route: &str, payload: Payload) -> Result<Self> {
        Self::request(stream_id, FrameType::RequestFnf, 0, route, payload)
    }

    pub fn request_stream(
        stream_id: u32,
        route: &str,
        payload: Payload,
        initial_n: u32,
    ) -> Result<Self> {
        let mut frame = Self::request(stream_id, FrameType::RequestStream, 0, route, payload)?;
        frame.request_n = checked_request_n(initial_n)?;
        Ok(frame)
    }

    /// REQUEST_CHANNEL carrying the requester's first payload.
    ///
    /// `complete` marks the first payload as the requester's only one.
    pub fn request_channel(
        stream_id: u32,
        route: &str,
        payload: Payload,
        initial_n: u32,
        complete: bool,
    ) -> Result<Self> {
        let frame_flags = if complete { flags::COMPLETE } else { 0 };
        let mut frame =
            Self::request(stream_id, FrameType::RequestChannel, frame_flags, route, payload)?;
        frame.request_n = checked_request_n(initial_n)?;
        Ok(frame)
    }

    pub fn request_n(stream_id: u32, n: u32) -> Self {
        let mut frame = Frame::new(stream_id, FrameType::RequestN, 0);
        frame.request_n = n.clamp(1, MAX_REQUEST_N);
        frame
    }

    pub fn cancel(stream_id: u32) -> Self {
        Frame::new(stream_id, FrameType::Cancel, 0)
    }

    /// PAYLOAD carrying a value, optionally completing the stream.
    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        let frame_flags = if complete {
            flags::NEXT_COMPLETE
        } else {
            flags::NEXT
        };
        Frame::new(stream_id, FrameType::Payload, frame_flags).with_payload(payload)
    }

    /// Explicit COMPLETE frame (no value).
    pub fn complete(stream_id: u32) -> Self {
        Frame::new(stream_id, FrameType::Complete, 0)
    }

    pub fn error(stream_id: u32, code: u32, message: &str) -> Self {
        let mut frame = Frame::new(stream_id, FrameType::Error, 0);
        frame.error_code = code;
        frame.data = Bytes::copy_from_slice(message.as_bytes());
        frame
    }

    /// ERROR frame describing a local failure.
    pub fn error_from(stream_id: u32, err: &RSocketError) -> Self {
        Self::error(stream_id, err.wire_code(), &err.wire_message())
    }

    #[inline]
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    #[inline]
    pub fn is_next(&self) -> bool {
        flags::has_flag(self.flags, flags::NEXT)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        flags::has_flag(self.flags, flags::COMPLETE)
    }

    #[inline]
    pub fn follows(&self) -> bool {
        flags::has_flag(self.flags, flags::FOLLOWS)
    }

    #[inline]
    pub fn wants_response(&self) -> bool {
        flags::has_flag(self.flags, flags::RESPOND)
    }

    /// Error message of an ERROR frame (lossy UTF-8).
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Route key of a REQUEST_* frame, `None` when no routing tag is present.
    pub fn route(&self) -> Result<Option<String>> {
        match &self.metadata {
            Some(metadata) if self.frame_type.is_request() => {
                split_route_metadata(metadata).map(|(route, _)| Some(route))
            }
            _ => Ok(None),
        }
    }

    /// Convert into the application payload, stripping the routing tag of
    /// REQUEST_* frames.
    pub fn into_payload(self) -> Result<Payload> {
        let metadata = match self.metadata {
            Some(metadata) if self.frame_type.is_request() => {
                split_route_metadata(&metadata)?.1
            }
            other => other,
        };
        Ok(Payload {
            metadata,
            data: self.data,
        })
    }

    /// Convert into an error result (for ERROR frames).
    pub fn into_remote_error(self) -> RSocketError {
        RSocketError::Remote {
            code: self.error_code,
            message: self.error_message(),
        }
    }

    /// Encode as three parts: header and fixed fields, metadata, data.
    ///
    /// The writer task sends the parts with vectored writes.
    pub fn encode_parts(&self) -> (Bytes, Bytes, Bytes) {
        let metadata = self.metadata.clone().unwrap_or_default();
        debug_assert!(metadata.len() <= MAX_METADATA_LENGTH);

        let mut frame_flags = self.flags & !flags::METADATA_PRESENT;
        if self.metadata.is_some() {
            frame_flags |= flags::METADATA_PRESENT;
        }

        let mut head = BytesMut::with_capacity(HEADER_SIZE + 32);
        head.put_bytes(0, HEADER_SIZE);

        match self.frame_type {
            t if t.has_request_n() => head.put_u32(self.request_n),
            FrameType::Error => head.put_u32(self.error_code),
            FrameType::Setup => self
                .setup
                .clone()
                .unwrap_or_default()
                .encode_into(&mut head),
            _ => {}
        }
        if self.metadata.is_some() {
            head.put_uint(metadata.len() as u64, METADATA_LENGTH_SIZE);
        }

        let length = head.len() - LENGTH_FIELD_SIZE + metadata.len() + self.data.len();
        let header = Header::new(length as u32, self.stream_id, self.frame_type, frame_flags);
        header.encode_into(&mut head[..HEADER_SIZE]);

        (head.freeze(), metadata, self.data.clone())
    }

    /// Encode into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let (head, metadata, data) = self.encode_parts();
        let mut buf = BytesMut::with_capacity(head.len() + metadata.len() + data.len());
        buf.extend_from_slice(&head);
        buf.extend_from_slice(&metadata);
        buf.extend_from_slice(&data);
        buf.freeze()
    }

    /// Encoded size without building the buffer.
    pub fn encoded_len(&self) -> usize {
        let fields = match self.frame_type {
            t if t.has_request_n() => 4,
            FrameType::Error => 4,
            FrameType::Setup => {
                let setup = self.setup.clone().unwrap_or_default();
                12 + 2
                    + setup.metadata_mime_type.len().min(255)
                    + setup.data_mime_type.len().min(255)
            }
            _ => 0,
        };
        let metadata = self
            .metadata
            .as_ref()
            .map(|m| METADATA_LENGTH_SIZE + m.len())
            .unwrap_or(0);
        HEADER_SIZE + fields + metadata + self.data.len()
    }

    /// Parse one complete frame (length prefix included) without copying.
    pub fn parse(frame: Bytes, max_frame_size: u32) -> std::result::Result<Self, DecodeError> {
        let header = Header::decode(&frame)
            .ok_or_else(|| DecodeError::malformed("frame shorter than header"))?;
        if header.frame_size() != frame.len() {
            return Err(DecodeError::malformed(format!(
                "frame length {} does not match buffer of {}",
                header.frame_size(),
                frame.len()
            )));
        }
        let frame_type = header.validate(max_frame_size)?;
        let mut body = frame.slice(HEADER_SIZE..);

        let mut parsed = Frame::new(header.stream_id, frame_type, header.flags);
        parsed.flags = header.flags;

        if frame_type.has_request_n() {
            if body.remaining() < 4 {
                return Err(DecodeError::malformed(format!("{} without request-n", frame_type)));
            }
            let n = body.get_u32();
            if n == 0 || n > MAX_REQUEST_N {
                return Err(DecodeError::malformed(format!("invalid request-n {}", n)));
            }
            parsed.request_n = n;
        } else if frame_type == FrameType::Error {
            if body.remaining() < 4 {
                return Err(DecodeError::malformed("ERROR without error code"));
            }
            parsed.error_code = body.get_u32();
        } else if frame_type == FrameType::Setup {
            parsed.setup = Some(SetupParams::decode_from(&mut body)?);
        }

        if flags::has_flag(header.flags, flags::METADATA_PRESENT) {
            if body.remaining() < METADATA_LENGTH_SIZE {
                return Err(DecodeError::malformed("metadata length truncated"));
            }
            let len = body.get_uint(METADATA_LENGTH_SIZE) as usize;
            if len > body.remaining() {
                return Err(DecodeError::malformed(format!(
                    "metadata length {} overruns frame ({} bytes left)",
                    len,
                    body.remaining()
                )));
            }
            parsed.metadata = Some(body.split_to(len));
        }

        parsed.data = body;
        Ok(parsed)
    }
}

/// Length of the frame starting at `buf`, once the length prefix is readable.
pub(crate) fn peek_frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < LENGTH_FIELD_SIZE {
        return None;
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(LENGTH_FIELD_SIZE + length)
}

/// Encode a frame into one contiguous buffer.
#[inline]
pub fn encode(frame: &Frame) -> Bytes {
    frame.encode()
}

/// Decode the first frame in `buf`, returning it with the number of bytes consumed.
///
/// `Truncated` means more bytes are needed; `Malformed` is fatal.
pub fn decode(buf: &[u8]) -> std::result::Result<(Frame, usize), DecodeError> {
    decode_with_limit(buf, DEFAULT_MAX_FRAME_SIZE)
}

/// [`decode`] with an explicit maximum frame length.
pub fn decode_with_limit(
    buf: &[u8],
    max_frame_size: u32,
) -> std::result::Result<(Frame, usize), DecodeError> {
    let total = peek_frame_size(buf).ok_or(DecodeError::Truncated {
        needed: HEADER_SIZE,
        available: buf.len(),
    })?;
    if total < LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE {
        return Err(DecodeError::malformed(format!(
            "frame length {} shorter than header",
            total - LENGTH_FIELD_SIZE
        )));
    }
    if total - LENGTH_FIELD_SIZE > max_frame_size as usize {
        return Err(DecodeError::malformed(format!(
            "frame size {} exceeds maximum {}",
            total - LENGTH_FIELD_SIZE,
            max_frame_size
        )));
    }
    if buf.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }
    let frame = Frame::parse(Bytes::copy_from_slice(&buf[..total]), max_frame_size)?;
    Ok((frame, total))
}

fn checked_request_n(n: u32) -> Result<u32> {
    if n == 0 {
        return Err(RSocketError::Protocol("request-n must be positive".to_string()));
    }
    Ok(n.min(MAX_REQUEST_N))
}

/// Build request metadata: `[u8 route length][route][application metadata]`.
pub fn encode_route_metadata(route: &str, extra: Option<&Bytes>) -> Result<Bytes> {
    if route.is_empty() || route.len() > MAX_ROUTE_LENGTH {
        return Err(RSocketError::Protocol(format!(
            "route key must be 1..={} bytes, got {}",
            MAX_ROUTE_LENGTH,
            route.len()
        )));
    }
    let extra_len = extra.map(|e| e.len()).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(1 + route.len() + extra_len);
    buf.put_u8(route.len() as u8);
    buf.put_slice(route.as_bytes());
    if let Some(extra) = extra {
        buf.put_slice(extra);
    }
    Ok(buf.freeze())
}

/// Split request metadata into the route and the remaining application metadata.
pub fn split_route_metadata(metadata: &Bytes) -> Result<(String, Option<Bytes>)> {
    let len = *metadata
        .first()
        .ok_or_else(|| RSocketError::Protocol("empty routing metadata".to_string()))?
        as usize;
    if len == 0 || metadata.len() < 1 + len {
        return Err(RSocketError::Protocol(
            "routing tag overruns metadata".to_string(),
        ));
    }
    let route = std::str::from_utf8(&metadata[1..1 + len])
        .map_err(|_| RSocketError::Protocol("route key is not UTF-8".to_string()))?
        .to_string();
    let rest = metadata.slice(1 + len..);
    Ok((route, if rest.is_empty() { None } else { Some(rest) }))
}
