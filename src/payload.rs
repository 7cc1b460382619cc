//! Application payload: optional metadata plus opaque data.
//!
//! Payloads are what handlers receive and return. The protocol never looks
//! inside `data`; the codec helpers are conveniences for typed handlers.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::Payload;
//!
//! let payload = Payload::from("Hello Rsocket!");
//! assert_eq!(payload.data_utf8().unwrap(), "Hello Rsocket!");
//! assert!(payload.metadata().is_none());
//! ```

use bytes::Bytes;

use crate::codec::{JsonCodec, MsgPackCodec};
use crate::error::{RSocketError, Result};

/// One unit of application data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Application metadata (route tags are stripped before delivery).
    pub metadata: Option<Bytes>,
    /// Opaque application data.
    pub data: Bytes,
}

impl Payload {
    /// Payload with data only.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            data: data.into(),
        }
    }

    /// Payload with data and metadata.
    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self {
            metadata: Some(metadata.into()),
            data: data.into(),
        }
    }

    /// Empty payload (no metadata, no data).
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }

    /// Data interpreted as UTF-8.
    pub fn data_utf8(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|e| RSocketError::Protocol(format!("payload is not UTF-8: {}", e)))
    }

    /// Encode a value as JSON data.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(JsonCodec::encode(value)?))
    }

    /// Decode JSON data.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        JsonCodec::decode(&self.data)
    }

    /// Encode a value as MsgPack data.
    pub fn msgpack<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(MsgPackCodec::encode(value)?))
    }

    /// Decode MsgPack data.
    pub fn decode_msgpack<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.data)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::new(Bytes::from(data))
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}
