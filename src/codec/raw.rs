//! Raw codec - bytes pass through untouched.

use bytes::Bytes;

/// Codec for data that is already encoded.
pub struct RawCodec;

impl RawCodec {
    /// Copy a slice into `Bytes`.
    ///
    /// Use [`RawCodec::encode_bytes`] to avoid the copy when you already own `Bytes`.
    #[inline]
    pub fn encode(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[inline]
    pub fn encode_bytes(data: Bytes) -> Bytes {
        data
    }

    #[inline]
    pub fn decode(data: &[u8]) -> &[u8] {
        data
    }
}
