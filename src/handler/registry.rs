//! Router mapping route keys to handlers.
//!
//! Each route has exactly one handler; the handler's kind decides which
//! interaction models it can serve. Exact routes are tried first, then
//! templates in registration order.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::handler::Router;
//! use rsocket_mux::Payload;
//!
//! let mut router = Router::new();
//! router
//!     .response("greeting", |_payload: Payload, _ctx| async move {
//!         Ok(Payload::from("Hello back to you!"))
//!     })
//!     .unwrap();
//!
//! assert!(router.contains("greeting"));
//! assert!(router.response("greeting", |p: Payload, _ctx| async move { Ok(p) }).is_err());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::context::{RouteContext, RouteTemplate};
use crate::error::{RSocketError, Result};
use crate::payload::Payload;
use crate::protocol::MAX_ROUTE_LENGTH;
use crate::stream::{InteractionModel, PayloadStream};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy sequence of payloads produced by a handler.
pub type PayloadSource = BoxStream<'static, Result<Payload>>;

/// One payload in, one payload out.
pub trait ResponseHandler: Send + Sync + 'static {
    fn call(&self, payload: Payload, ctx: RouteContext) -> BoxFuture<'static, Result<Payload>>;
}

/// One payload in, nothing out.
pub trait FireAndForgetHandler: Send + Sync + 'static {
    fn call(&self, payload: Payload, ctx: RouteContext) -> BoxFuture<'static, Result<()>>;
}

/// One payload in, many out.
pub trait StreamHandler: Send + Sync + 'static {
    fn call(&self, payload: Payload, ctx: RouteContext) -> PayloadSource;
}

/// Many in, many out.
pub trait ChannelHandler: Send + Sync + 'static {
    fn call(&self, inbound: PayloadStream, ctx: RouteContext) -> PayloadSource;
}

impl<F, Fut> ResponseHandler for F
where
    F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RouteContext) -> BoxFuture<'static, Result<Payload>> {
        Box::pin(self(payload, ctx))
    }
}

impl<F, Fut> FireAndForgetHandler for F
where
    F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RouteContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(payload, ctx))
    }
}

impl<F, S> StreamHandler for F
where
    F: Fn(Payload, RouteContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RouteContext) -> PayloadSource {
        self(payload, ctx).boxed()
    }
}

impl<F, S> ChannelHandler for F
where
    F: Fn(PayloadStream, RouteContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload>> + Send + 'static,
{
    fn call(&self, inbound: PayloadStream, ctx: RouteContext) -> PayloadSource {
        self(inbound, ctx).boxed()
    }
}

/// Response handler that decodes its input and encodes its output as JSON.
pub struct JsonHandler<F, T, R, Fut>
where
    F: Fn(T, RouteContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> JsonHandler<F, T, R, Fut>
where
    F: Fn(T, RouteContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> ResponseHandler for JsonHandler<F, T, R, Fut>
where
    F: Fn(T, RouteContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, payload: Payload, ctx: RouteContext) -> BoxFuture<'static, Result<Payload>> {
        let parsed: T = match payload.decode_json() {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move { Payload::json(&fut.await?) })
    }
}

/// A registered handler and the capability it provides.
#[derive(Clone)]
pub enum Handler {
    Response(Arc<dyn ResponseHandler>),
    FireAndForget(Arc<dyn FireAndForgetHandler>),
    Stream(Arc<dyn StreamHandler>),
    Channel(Arc<dyn ChannelHandler>),
}

impl Handler {
    /// Model the handler was written for.
    pub fn model(&self) -> InteractionModel {
        match self {
            Handler::Response(_) => InteractionModel::RequestResponse,
            Handler::FireAndForget(_) => InteractionModel::FireAndForget,
            Handler::Stream(_) => InteractionModel::RequestStream,
            Handler::Channel(_) => InteractionModel::RequestChannel,
        }
    }

    /// Whether a request of `model` can be served, natively or adapted.
    ///
    /// Response handlers also serve request-stream (one element) and
    /// fire-and-forget (reply dropped); fire-and-forget handlers also serve
    /// request-response (empty reply).
    pub fn accepts(&self, model: InteractionModel) -> bool {
        use InteractionModel::*;
        match self {
            Handler::Response(_) => matches!(model, RequestResponse | RequestStream | FireAndForget),
            Handler::FireAndForget(_) => matches!(model, FireAndForget | RequestResponse),
            Handler::Stream(_) => model == RequestStream,
            Handler::Channel(_) => model == RequestChannel,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler({})", self.model())
    }
}

/// An incoming request, ready to hand to a handler.
#[derive(Debug)]
pub enum Request {
    FireAndForget(Payload),
    Response(Payload),
    Stream(Payload),
    Channel(PayloadStream),
}

impl Request {
    pub fn model(&self) -> InteractionModel {
        match self {
            Request::FireAndForget(_) => InteractionModel::FireAndForget,
            Request::Response(_) => InteractionModel::RequestResponse,
            Request::Stream(_) => InteractionModel::RequestStream,
            Request::Channel(_) => InteractionModel::RequestChannel,
        }
    }
}

/// What a handler produced for a request.
pub enum Reply {
    /// Fire-and-forget: completion only.
    Empty(BoxFuture<'static, Result<()>>),
    /// Request-response: one payload.
    Single(BoxFuture<'static, Result<Payload>>),
    /// Request-stream and request-channel: many payloads.
    Many(PayloadSource),
}

/// A resolved route: the handler plus the context it will run with.
#[derive(Debug, Clone)]
pub struct Route {
    handler: Handler,
    ctx: RouteContext,
}

impl Route {
    #[inline]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    #[inline]
    pub fn context(&self) -> &RouteContext {
        &self.ctx
    }

    #[inline]
    pub fn accepts(&self, model: InteractionModel) -> bool {
        self.handler.accepts(model)
    }

    /// Run the handler on `request`, adapting its output to the request's model.
    pub fn invoke(self, request: Request) -> Result<Reply> {
        let Route { handler, ctx } = self;
        let reply = match (handler, request) {
            (Handler::Response(h), Request::Response(payload)) => Reply::Single(h.call(payload, ctx)),
            (Handler::Response(h), Request::Stream(payload)) => {
                Reply::Many(stream::once(h.call(payload, ctx)).boxed())
            }
            (Handler::Response(h), Request::FireAndForget(payload)) => {
                let fut = h.call(payload, ctx);
                Reply::Empty(Box::pin(async move { fut.await.map(|_| ()) }))
            }
            (Handler::FireAndForget(h), Request::FireAndForget(payload)) => {
                Reply::Empty(h.call(payload, ctx))
            }
            (Handler::FireAndForget(h), Request::Response(payload)) => {
                let fut = h.call(payload, ctx);
                Reply::Single(Box::pin(async move { fut.await.map(|_| Payload::empty()) }))
            }
            (Handler::Stream(h), Request::Stream(payload)) => Reply::Many(h.call(payload, ctx)),
            (Handler::Channel(h), Request::Channel(inbound)) => Reply::Many(h.call(inbound, ctx)),
            (_, request) => {
                return Err(RSocketError::ModelMismatch {
                    route: ctx.route().to_string(),
                    model: request.model().name(),
                })
            }
        };
        Ok(reply)
    }
}

/// Registry mapping route keys to handlers.
///
/// Built before the connection starts and immutable afterwards.
#[derive(Default, Clone)]
pub struct Router {
    exact: HashMap<String, Handler>,
    templates: Vec<(RouteTemplate, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `route`. `{name}` segments make it a template.
    pub fn register(&mut self, route: &str, handler: Handler) -> Result<()> {
        if route.is_empty() || route.len() > MAX_ROUTE_LENGTH {
            return Err(RSocketError::Protocol(format!(
                "route key must be 1..={} bytes: {:?}",
                MAX_ROUTE_LENGTH, route
            )));
        }

        let template = RouteTemplate::parse(route)?;
        if template.is_template() {
            if self.templates.iter().any(|(t, _)| t.pattern() == route) {
                return Err(RSocketError::DuplicateRoute(route.to_string()));
            }
            self.templates.push((template, handler));
        } else {
            if self.exact.contains_key(route) {
                return Err(RSocketError::DuplicateRoute(route.to_string()));
            }
            self.exact.insert(route.to_string(), handler);
        }
        tracing::debug!(route, "Registered route");
        Ok(())
    }

    pub fn response<F, Fut>(&mut self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register(route, Handler::Response(Arc::new(handler)))
    }

    /// Response handler with JSON request and reply bodies.
    pub fn json<F, T, R, Fut>(&mut self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(T, RouteContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.register(route, Handler::Response(Arc::new(JsonHandler::new(handler))))
    }

    pub fn fire_and_forget<F, Fut>(&mut self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(route, Handler::FireAndForget(Arc::new(handler)))
    }

    pub fn stream<F, S>(&mut self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(Payload, RouteContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        self.register(route, Handler::Stream(Arc::new(handler)))
    }

    pub fn channel<F, S>(&mut self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(PayloadStream, RouteContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        self.register(route, Handler::Channel(Arc::new(handler)))
    }

    /// Whether `route` resolves to a handler.
    pub fn contains(&self, route: &str) -> bool {
        self.exact.contains_key(route) || self.templates.iter().any(|(t, _)| t.matches(route).is_some())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the handler for `route` and build its context.
    pub fn resolve(&self, route: &str, stream_id: u32, model: InteractionModel) -> Result<Route> {
        if let Some(handler) = self.exact.get(route) {
            return Ok(Route {
                handler: handler.clone(),
                ctx: RouteContext::new(route, stream_id, model),
            });
        }
        for (template, handler) in &self.templates {
            if let Some(variables) = template.matches(route) {
                return Ok(Route {
                    handler: handler.clone(),
                    ctx: RouteContext::new(route, stream_id, model).with_variables(variables),
                });
            }
        }
        Err(RSocketError::NoSuchRoute(route.to_string()))
    }

    /// Resolve `route` and run its handler on `request`.
    pub fn dispatch(&self, route: &str, stream_id: u32, request: Request) -> Result<Reply> {
        self.resolve(route, stream_id, request.model())?
            .invoke(request)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "templates",
                &self.templates.iter().map(|(t, _)| t.pattern()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
