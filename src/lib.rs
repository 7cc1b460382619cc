//! # rsocket-mux
//!
//! Connection-level multiplexing for RSocket-style interactions over any
//! async byte stream.
//!
//! One connection carries many logical streams, each following one of four
//! interaction models:
//!
//! - **request-response**: one payload in, one payload out
//! - **fire-and-forget**: one payload in, nothing out
//! - **request-stream**: one payload in, a flow-controlled stream out
//! - **request-channel**: flow-controlled streams in both directions
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): length-prefixed binary frames, zero-copy
//!   decoding, fragmentation and reassembly
//! - **Streams** ([`stream`]): id allocation, per-stream state machines and
//!   the consumer-side [`PayloadStream`]
//! - **Flow control** ([`flow`]): REQUEST_N credit accounting
//! - **Routing** ([`handler`]): route keys and `{name}` templates mapped to
//!   handlers
//! - **Driver** ([`Connection`]): a reader task dispatching frames and a
//!   writer task owning the write half
//!
//! ## Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use rsocket_mux::{ConnectionBuilder, Payload};
//!
//! #[tokio::main]
//! async fn main() -> rsocket_mux::Result<()> {
//!     let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//!
//!     let _server = ConnectionBuilder::server()
//!         .response("greeting", |_p, _ctx| async move {
//!             Ok(Payload::from("Hello back to you!"))
//!         })
//!         .stream("count", |_p, _ctx| {
//!             futures::stream::iter((0..3).map(|i| Ok(Payload::from(i.to_string()))))
//!         })
//!         .start(server_io)
//!         .await?;
//!
//!     let client = ConnectionBuilder::client().start(client_io).await?;
//!
//!     let reply = client.request_response("greeting", Payload::from("Hello Rsocket!")).await?;
//!     println!("{}", reply.data_utf8()?);
//!
//!     let mut counts = client.request_stream("count", Payload::empty(), 8).await?;
//!     while let Some(value) = counts.next().await {
//!         println!("{}", value?.data_utf8()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod flow;
pub mod handler;
pub mod protocol;
pub mod stream;
pub mod writer;

mod connection;
mod payload;

pub use connection::{
    Connection, ConnectionBuilder, ConnectionConfig, ConnectionStats,
    DEFAULT_CHANNEL_REQUEST_N, DEFAULT_MAX_CONCURRENT_HANDLERS,
};
pub use error::{DecodeError, RSocketError, Result};
pub use handler::{RouteContext, Router};
pub use payload::Payload;
pub use stream::{InteractionModel, PayloadStream, Side, StreamState};
