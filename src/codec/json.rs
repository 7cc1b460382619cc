//! JSON codec using `serde_json`.

use bytes::Bytes;

use crate::error::Result;

/// JSON codec for payload data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value as compact JSON.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Decode JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `RSocketError::Json` if the bytes are not valid JSON for `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
