//! Handler module - route registration and dispatch.
//!
//! Provides:
//! - [`Router`] - maps route keys (and `{name}` templates) to handlers
//! - [`RouteContext`] - what a handler knows about the request it serves
//! - handler traits for the four capabilities, implemented for closures
//!
//! # Example
//!
//! ```
//! use futures::stream;
//! use rsocket_mux::handler::Router;
//! use rsocket_mux::Payload;
//!
//! let mut router = Router::new();
//!
//! router
//!     .response("greeting/{name}", |_p: Payload, ctx| async move {
//!         Ok(Payload::from(format!("Hello {}!", ctx.variable("name").unwrap_or("there"))))
//!     })
//!     .unwrap();
//!
//! router
//!     .stream("count", |_p: Payload, _ctx| {
//!         stream::iter((0..3).map(|i| Ok(Payload::from(i.to_string()))))
//!     })
//!     .unwrap();
//! ```

mod context;
mod registry;

pub use context::{RouteContext, RouteTemplate};
pub use registry::{
    BoxFuture, ChannelHandler, FireAndForgetHandler, Handler, JsonHandler, PayloadSource, Reply,
    Request, ResponseHandler, Route, Router, StreamHandler,
};
