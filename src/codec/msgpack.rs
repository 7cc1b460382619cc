//! MessagePack codec using `rmp-serde`.
//!
//! Always encodes with `to_vec_named`: structs become maps keyed by field
//! name, which is what dynamically typed peers expect. `to_vec` would emit
//! positional arrays.

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for payload data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value, structs as maps.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns `RSocketError::MsgPackDecode` if the bytes don't describe a `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
