//! Payload codecs.
//!
//! The protocol treats payload data as opaque bytes. These helpers cover the
//! encodings handlers commonly use:
//!
//! - [`RawCodec`] - bytes pass through untouched
//! - [`JsonCodec`] - JSON via `serde_json` (the default data mime type)
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde`, structs as maps
//!
//! Codecs are marker structs with static methods, so the choice is made at
//! compile time and `Payload` can expose typed shortcuts.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::codec::{JsonCodec, MsgPackCodec, RawCodec};
//!
//! let json = JsonCodec::encode(&"hello").unwrap();
//! assert_eq!(&json[..], b"\"hello\"");
//!
//! let packed = MsgPackCodec::encode(&42u32).unwrap();
//! let n: u32 = MsgPackCodec::decode(&packed).unwrap();
//! assert_eq!(n, 42);
//!
//! let raw = RawCodec::encode(b"binary");
//! assert_eq!(RawCodec::decode(&raw), b"binary");
//! ```

mod json;
mod msgpack;
mod raw;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;
