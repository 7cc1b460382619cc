//! Connection driver: one reader task, one writer task, many streams.
//!
//! A [`Connection`] owns both halves of a byte stream. The reader task
//! decodes frames and dispatches them, either to a local requester waiting
//! on a stream or to a handler from the [`Router`]. The writer task (see
//! [`crate::writer`]) is the only thing that touches the write half.
//!
//! # Example
//!
//! ```ignore
//! use rsocket_mux::{ConnectionBuilder, Payload};
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//!
//! let _server = ConnectionBuilder::server()
//!     .response("greeting", |_payload, _ctx| async move {
//!         Ok(Payload::from("Hello back to you!"))
//!     })
//!     .start(b)
//!     .await?;
//!
//! let client = ConnectionBuilder::client().start(a).await?;
//! let reply = client.request_response("greeting", Payload::from("Hello Rsocket!")).await?;
//! assert_eq!(reply.data(), b"Hello back to you!");
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RSocketError, Result};
use crate::flow::{Credit, CreditGate};
use crate::handler::{BoxFuture, PayloadSource, Reply, Request, RouteContext, Router};
use crate::payload::Payload;
use crate::protocol::{
    error_code, fragment, Frame, FrameBuffer, FrameType, Reassembler, SetupParams,
    CONNECTION_STREAM_ID, DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE, MAJOR_VERSION,
};
use crate::stream::{
    Event, InboundControl, InteractionModel, PayloadStream, Role, Side, Sink, StreamEntry,
    StreamMachine, StreamState, StreamTable,
};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Default limit on handlers running at once.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default credit a channel responder grants (and re-grants) to the requester.
pub const DEFAULT_CHANNEL_REQUEST_N: u32 = 32;

/// Read buffer size for the reader task.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Which end we are; decides id parity and who sends SETUP.
    pub side: Side,
    /// Parameters sent in SETUP (client) or expected from the peer (server).
    pub setup: SetupParams,
    /// Whether the client sends KEEPALIVE and enforces the max lifetime.
    pub keepalive: bool,
    /// Largest frame accepted from the peer, and sent without fragmenting.
    pub max_frame_size: u32,
    /// Split outbound frames larger than this; `None` disables fragmentation.
    pub fragment_mtu: Option<usize>,
    /// Handlers allowed to run at once. Requests beyond it are rejected.
    pub max_concurrent_handlers: usize,
    /// Credit batch for the inbound side of channels we serve.
    pub channel_request_n: u32,
    pub writer: WriterConfig,
}

impl ConnectionConfig {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            setup: SetupParams::default(),
            keepalive: side == Side::Client,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            fragment_mtu: None,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            channel_request_n: DEFAULT_CHANNEL_REQUEST_N,
            writer: WriterConfig::default(),
        }
    }
}

/// Point-in-time copy of a connection's anomaly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub no_such_route: u64,
    pub protocol_violations: u64,
    pub flow_control_violations: u64,
    pub orphan_frames: u64,
    pub handler_failures: u64,
    pub rejected_requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    no_such_route: AtomicU64,
    protocol_violations: AtomicU64,
    flow_control_violations: AtomicU64,
    orphan_frames: AtomicU64,
    handler_failures: AtomicU64,
    rejected_requests: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            no_such_route: self.no_such_route.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            flow_control_violations: self.flow_control_violations.load(Ordering::Relaxed),
            orphan_frames: self.orphan_frames.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
        }
    }
}

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    router: Router,
    config: ConnectionConfig,
    /// First registration failure, reported by `start`.
    error: Option<RSocketError>,
}

impl ConnectionBuilder {
    pub fn new(side: Side) -> Self {
        Self {
            router: Router::new(),
            config: ConnectionConfig::new(side),
            error: None,
        }
    }

    /// Builder for the connecting end (odd stream ids, sends SETUP).
    pub fn client() -> Self {
        Self::new(Side::Client)
    }

    /// Builder for the accepting end (even stream ids).
    pub fn server() -> Self {
        Self::new(Side::Server)
    }

    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Replace the router wholesale.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn response<F, Fut>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        let result = self.router.response(route, handler);
        self.record(result)
    }

    /// Response handler with JSON request and reply bodies.
    pub fn json<F, T, R, Fut>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(T, RouteContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let result = self.router.json(route, handler);
        self.record(result)
    }

    pub fn fire_and_forget<F, Fut>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(Payload, RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let result = self.router.fire_and_forget(route, handler);
        self.record(result)
    }

    pub fn stream<F, S>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(Payload, RouteContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        let result = self.router.stream(route, handler);
        self.record(result)
    }

    pub fn channel<F, S>(mut self, route: &str, handler: F) -> Self
    where
        F: Fn(PayloadStream, RouteContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        let result = self.router.channel(route, handler);
        self.record(result)
    }

    /// SETUP parameters (version, keepalive timing, mime types).
    pub fn setup(mut self, setup: SetupParams) -> Self {
        self.config.setup = setup;
        self
    }

    pub fn keepalive(mut self, interval: Duration, max_lifetime: Duration) -> Self {
        self.config.keepalive = true;
        self.config.setup.keepalive_interval = interval;
        self.config.setup.max_lifetime = max_lifetime;
        self
    }

    pub fn disable_keepalive(mut self) -> Self {
        self.config.keepalive = false;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Fragment outbound frames bigger than `mtu` bytes.
    pub fn fragment_mtu(mut self, mtu: usize) -> Self {
        self.config.fragment_mtu = Some(mtu);
        self
    }

    pub fn max_concurrent_handlers(mut self, n: usize) -> Self {
        self.config.max_concurrent_handlers = n;
        self
    }

    pub fn channel_request_n(mut self, n: u32) -> Self {
        self.config.channel_request_n = n.max(1);
        self
    }

    /// Maximum pending frames before backpressure.
    pub fn max_pending_frames(mut self, n: usize) -> Self {
        self.config.writer.max_pending_frames = n;
        self
    }

    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Start the connection on `io`.
    ///
    /// The client side sends SETUP before anything else.
    pub async fn start<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some(e) = self.error {
            return Err(e);
        }
        let config = self.config;
        let (reader, writer) = tokio::io::split(io);

        let closed = CancellationToken::new();
        let (writer_handle, writer_task) =
            spawn_writer_task(writer, config.writer.clone(), closed.clone());

        let shared = Arc::new(Shared {
            side: config.side,
            table: Mutex::new(StreamTable::new()),
            router: self.router,
            writer: writer_handle,
            counters: Counters::default(),
            closed,
            handlers: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            peer_setup: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            config,
        });

        if shared.side == Side::Client {
            shared
                .writer
                .send(OutboundFrame::new(&Frame::setup(shared.config.setup.clone())))
                .await?;
        }

        tokio::spawn(watch_writer(shared.clone(), writer_task));
        let reader_task = tokio::spawn(read_loop(shared.clone(), reader));
        if shared.side == Side::Client && shared.config.keepalive {
            tokio::spawn(keepalive_loop(shared.clone()));
        }

        debug!(side = ?shared.side, "Connection started");

        Ok(Connection {
            shared,
            reader_task,
        })
    }
}

/// A running connection.
///
/// Requests can be issued from many tasks at once through `&self`. Dropping
/// the handle does not stop the connection; use [`Connection::close`].
pub struct Connection {
    shared: Arc<Shared>,
    reader_task: JoinHandle<Result<()>>,
}

impl Connection {
    /// Send a request and wait for the single reply.
    ///
    /// Dropping the returned future before it resolves cancels the request.
    pub async fn request_response(&self, route: &str, payload: Payload) -> Result<Payload> {
        let (tx, rx) = oneshot::channel();
        let (frame, _) = self.shared.open_stream(
            InteractionModel::RequestResponse,
            |id| Frame::request_response(id, route, payload),
            |entry| entry.with_sink(Sink::Single(Some(tx))),
        )?;
        let guard = CancelGuard::new(self.shared.clone(), frame.stream_id);
        self.shared.send_request(frame).await?;

        let result = rx.await.unwrap_or(Err(RSocketError::ConnectionClosed));
        guard.disarm();
        result
    }

    /// Send a request that expects no reply.
    pub async fn fire_and_forget(&self, route: &str, payload: Payload) -> Result<()> {
        let (frame, _) = self.shared.open_stream(
            InteractionModel::FireAndForget,
            |id| Frame::request_fnf(id, route, payload),
            |entry| entry,
        )?;
        self.shared.send_request(frame).await
    }

    /// Request a stream of values, granting `initial_n` credits up front.
    ///
    /// Grant more with [`PayloadStream::request`] or
    /// [`PayloadStream::auto_replenish`].
    pub async fn request_stream(
        &self,
        route: &str,
        payload: Payload,
        initial_n: u32,
    ) -> Result<PayloadStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (frame, _) = self.shared.open_stream(
            InteractionModel::RequestStream,
            |id| Frame::request_stream(id, route, payload, initial_n),
            |entry| {
                entry
                    .with_inbound_credit(Credit::new(initial_n))
                    .with_sink(Sink::Many(tx))
            },
        )?;
        let stream_id = frame.stream_id;
        self.shared.send_request(frame).await?;
        Ok(PayloadStream::new(stream_id, rx, self.shared.clone()))
    }

    /// Open a channel: `payloads` flow out as the peer grants credit, and the
    /// returned stream yields what the peer sends back.
    ///
    /// The first element of `payloads` travels with the request itself, so
    /// `payloads` must yield at least one value.
    pub async fn request_channel<S>(
        &self,
        route: &str,
        payloads: S,
        initial_n: u32,
    ) -> Result<PayloadStream>
    where
        S: Stream<Item = Result<Payload>> + Send + 'static,
    {
        let mut source = payloads.boxed();
        let first = match source.next().await {
            Some(first) => first?,
            None => {
                return Err(RSocketError::Protocol(
                    "request-channel requires an initial payload".into(),
                ))
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // the first payload used the implicit credit of the request
        let gate = Arc::new(CreditGate::new(0));
        let (frame, cancel) = self.shared.open_stream(
            InteractionModel::RequestChannel,
            |id| Frame::request_channel(id, route, first, initial_n, false),
            |entry| {
                entry
                    .with_inbound_credit(Credit::new(initial_n))
                    .with_outbound_credit(gate.clone())
                    .with_sink(Sink::Many(tx))
            },
        )?;
        let stream_id = frame.stream_id;
        self.shared.send_request(frame).await?;

        tokio::spawn(self.shared.clone().produce(stream_id, source, gate, cancel, None));
        Ok(PayloadStream::new(stream_id, rx, self.shared.clone()))
    }

    /// Tell the peer we are closing, then tear everything down.
    pub async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        let goodbye = Frame::error(CONNECTION_STREAM_ID, error_code::CONNECTION_CLOSE, "closed");
        if let Err(e) = self.shared.writer.send(OutboundFrame::new(&goodbye)).await {
            debug!(error = %e, "Could not send close notice");
        }
        self.shared.terminate("closed locally");
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Wait for the reader task to finish and report why it stopped.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        match self.reader_task.await {
            Ok(result) => result,
            Err(e) => Err(RSocketError::Protocol(format!("reader task failed: {}", e))),
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.counters.snapshot()
    }

    /// Frames queued for the transport but not yet written.
    pub fn queued_frames(&self) -> usize {
        self.shared.writer.pending_frames()
    }

    /// Streams currently in the table.
    pub fn active_streams(&self) -> usize {
        self.shared.table().len()
    }

    /// State of an open stream, `None` once it has left the table.
    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.shared
            .table()
            .lookup(stream_id)
            .ok()
            .map(|entry| entry.machine.state())
    }

    /// SETUP received from the peer (server side).
    pub fn peer_setup(&self) -> Option<SetupParams> {
        lock(&self.shared.peer_setup).clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.shared.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Cancels an unanswered request-response when its future is dropped.
struct CancelGuard {
    shared: Arc<Shared>,
    stream_id: u32,
    armed: bool,
}

impl CancelGuard {
    fn new(shared: Arc<Shared>, stream_id: u32) -> Self {
        Self {
            shared,
            stream_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel(self.stream_id);
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared by the reader, the producers and the requester API.
struct Shared {
    side: Side,
    config: ConnectionConfig,
    table: Mutex<StreamTable>,
    router: Router,
    writer: WriterHandle,
    counters: Counters,
    /// Fires on teardown; every stream token is a child of it.
    closed: CancellationToken,
    handlers: Arc<Semaphore>,
    peer_setup: Mutex<Option<SetupParams>>,
    last_received: Mutex<Instant>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, StreamTable> {
        lock(&self.table)
    }

    /// Allocate an id and register a locally requested stream.
    ///
    /// Fire-and-forget requests get an id but are never kept in the table.
    fn open_stream(
        &self,
        model: InteractionModel,
        build: impl FnOnce(u32) -> Result<Frame>,
        entry: impl FnOnce(StreamEntry) -> StreamEntry,
    ) -> Result<(Frame, CancellationToken)> {
        if self.closed.is_cancelled() {
            return Err(RSocketError::ConnectionClosed);
        }
        let mut table = self.table();
        let stream_id = table.allocate(self.side)?;
        let frame = build(stream_id)?;
        self.check_size(&frame)?;

        let cancel = self.closed.child_token();
        if model != InteractionModel::FireAndForget {
            let machine = StreamMachine::new(model, Role::Requester, frame.flags);
            table.insert(
                stream_id,
                entry(StreamEntry::new(machine)).with_cancel(cancel.clone()),
            )?;
        }
        debug!(stream_id, model = %model, "Opened stream");
        Ok((frame, cancel))
    }

    /// Queue a request frame; forget the stream if that fails.
    async fn send_request(&self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        if let Err(e) = self.send_frame(frame).await {
            self.table().remove(stream_id);
            return Err(e);
        }
        Ok(())
    }

    fn check_size(&self, frame: &Frame) -> Result<()> {
        let size = frame.encoded_len() - LENGTH_FIELD_SIZE;
        if self.config.fragment_mtu.is_none() && size > self.config.max_frame_size as usize {
            return Err(RSocketError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                size, self.config.max_frame_size
            )));
        }
        Ok(())
    }

    /// Queue a frame, fragmenting it when an MTU is configured.
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        match self.config.fragment_mtu {
            Some(mtu) => {
                for part in fragment(frame, mtu) {
                    self.writer.send(OutboundFrame::new(&part)).await?;
                }
                Ok(())
            }
            _ => self.writer.send(OutboundFrame::new(&frame)).await,
        }
    }

    /// Validate a stream frame against its state machine, then queue it.
    ///
    /// A frame too large to send fails the stream with ERROR instead, so the
    /// peer is not left waiting; the size error is still returned.
    async fn emit(&self, frame: Frame) -> Result<()> {
        if let Err(e) = self.check_size(&frame) {
            let stream_id = frame.stream_id;
            Counters::bump(&self.counters.handler_failures);
            warn!(stream_id, error = %e, "Frame too large, failing stream");
            let error = Frame::error_from(stream_id, &e);
            self.account_send(&error)?;
            self.send_frame(error).await?;
            return Err(e);
        }
        self.account_send(&frame)?;
        self.send_frame(frame).await
    }

    fn account_send(&self, frame: &Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        let mut table = self.table();
        let entry = table.lookup(stream_id)?;
        entry.machine.on_send(frame)?;
        if entry.machine.is_terminal() {
            if let Some(mut entry) = table.remove(stream_id) {
                if frame.frame_type == FrameType::Error {
                    entry
                        .sink
                        .deliver(Err(RSocketError::HandlerFailure(frame.error_message())));
                }
                entry.cancel.cancel();
            }
            debug!(stream_id, "Stream finished");
        }
        Ok(())
    }

    /// Control frame from the reader task; never waits on the writer.
    fn send_detached(&self, frame: &Frame) {
        self.writer.send_detached(OutboundFrame::new(frame));
    }

    fn touch(&self) {
        *lock(&self.last_received) = Instant::now();
    }

    /// Handle one reassembled frame. Errors are fatal to the connection.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Setup => self.handle_setup(frame),
            FrameType::Keepalive => {
                if frame.wants_response() {
                    self.send_detached(&Frame::keepalive(false, frame.data));
                }
                Ok(())
            }
            FrameType::Error if frame.stream_id == CONNECTION_STREAM_ID => {
                Err(frame.into_remote_error())
            }
            t if t.is_request() => {
                self.accept_request(frame);
                Ok(())
            }
            _ => {
                self.route_to_stream(frame);
                Ok(())
            }
        }
    }

    fn handle_setup(&self, frame: Frame) -> Result<()> {
        let Some(setup) = frame.setup else {
            return Ok(());
        };
        if self.side == Side::Client {
            Counters::bump(&self.counters.protocol_violations);
            warn!("Ignoring SETUP sent to a client");
            return Ok(());
        }
        if setup.major_version != MAJOR_VERSION {
            let message = format!(
                "unsupported version {}.{}",
                setup.major_version, setup.minor_version
            );
            warn!(
                major = setup.major_version,
                minor = setup.minor_version,
                "Rejecting SETUP"
            );
            self.send_detached(&Frame::error(
                CONNECTION_STREAM_ID,
                error_code::UNSUPPORTED_SETUP,
                &message,
            ));
            return Err(RSocketError::Protocol(message));
        }

        let mut peer_setup = lock(&self.peer_setup);
        if peer_setup.is_some() {
            Counters::bump(&self.counters.protocol_violations);
            warn!("Ignoring repeated SETUP");
            return Ok(());
        }
        info!(
            version = %format!("{}.{}", setup.major_version, setup.minor_version),
            data_mime_type = %setup.data_mime_type,
            "Peer connected"
        );
        *peer_setup = Some(setup);
        Ok(())
    }

    /// Reject a request before it has a stream. Fire-and-forget gets nothing back.
    fn refuse(&self, stream_id: u32, model: InteractionModel, code: u32, message: &str) {
        if model != InteractionModel::FireAndForget {
            self.send_detached(&Frame::error(stream_id, code, message));
        }
    }

    fn accept_request(self: &Arc<Self>, frame: Frame) {
        let stream_id = frame.stream_id;
        let Some(model) = InteractionModel::from_request_type(frame.frame_type) else {
            return;
        };

        if Side::of(stream_id) != self.side.peer() || self.table().contains(stream_id) {
            Counters::bump(&self.counters.protocol_violations);
            warn!(stream_id, model = %model, "Request on an invalid stream id");
            return;
        }

        let route = match frame.route() {
            Ok(Some(route)) => route,
            Ok(None) => {
                Counters::bump(&self.counters.protocol_violations);
                warn!(stream_id, "Request without a route");
                self.refuse(stream_id, model, error_code::INVALID, "missing route");
                return;
            }
            Err(e) => {
                Counters::bump(&self.counters.protocol_violations);
                warn!(stream_id, error = %e, "Unreadable route metadata");
                self.refuse(stream_id, model, error_code::INVALID, &e.to_string());
                return;
            }
        };

        let resolved = match self.router.resolve(&route, stream_id, model) {
            Ok(resolved) if resolved.accepts(model) => resolved,
            Ok(_) => {
                let e = RSocketError::ModelMismatch {
                    route: route.clone(),
                    model: model.name(),
                };
                warn!(stream_id, route = %route, model = %model, "Handler cannot serve request");
                self.refuse(stream_id, model, e.wire_code(), &e.to_string());
                return;
            }
            Err(e) => {
                Counters::bump(&self.counters.no_such_route);
                warn!(stream_id, route = %route, model = %model, "No handler for route");
                self.refuse(stream_id, model, e.wire_code(), &e.to_string());
                return;
            }
        };

        let permit = match self.handlers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                Counters::bump(&self.counters.rejected_requests);
                warn!(stream_id, route = %route, "Handler limit reached, rejecting request");
                self.refuse(stream_id, model, error_code::REJECTED, "too many requests");
                return;
            }
        };

        let request_flags = frame.flags;
        let request_n = frame.request_n;
        let payload = match frame.into_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.refuse(stream_id, model, error_code::INVALID, &e.to_string());
                return;
            }
        };
        debug!(stream_id, route = %route, model = %model, "Accepted request");

        if model == InteractionModel::FireAndForget {
            if let Ok(Reply::Empty(fut)) = resolved.invoke(Request::FireAndForget(payload)) {
                let shared = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = fut.await {
                        Counters::bump(&shared.counters.handler_failures);
                        warn!(stream_id, error = %e, "Fire-and-forget handler failed");
                    }
                });
            }
            return;
        }

        let machine = StreamMachine::new(model, Role::Responder, request_flags);
        let cancel = self.closed.child_token();
        let mut entry = StreamEntry::new(machine).with_cancel(cancel.clone());
        let mut gate = None;
        let request = match model {
            InteractionModel::RequestStream | InteractionModel::RequestChannel => {
                let outbound = Arc::new(CreditGate::new(request_n));
                entry = entry.with_outbound_credit(outbound.clone());
                gate = Some(outbound);
                if model == InteractionModel::RequestStream {
                    Request::Stream(payload)
                } else {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let _ = tx.send(Ok(payload));
                    if entry.machine.inbound_open() {
                        entry = entry.with_sink(Sink::Many(tx));
                    }
                    let inbound = PayloadStream::new(stream_id, rx, self.clone())
                        .auto_replenish(self.config.channel_request_n);
                    Request::Channel(inbound)
                }
            }
            _ => Request::Response(payload),
        };

        let inbound_open = entry.machine.inbound_open();
        if let Err(e) = self.table().insert(stream_id, entry) {
            warn!(stream_id, error = %e, "Could not register stream");
            return;
        }
        if model == InteractionModel::RequestChannel && inbound_open {
            self.request(stream_id, self.config.channel_request_n);
        }

        match (resolved.invoke(request), gate) {
            (Ok(Reply::Single(fut)), _) => {
                tokio::spawn(self.clone().respond(stream_id, fut, cancel, permit));
            }
            (Ok(Reply::Many(source)), Some(gate)) => {
                tokio::spawn(self.clone().produce(stream_id, source, gate, cancel, Some(permit)));
            }
            (Ok(_), _) => {
                let e = RSocketError::ModelMismatch {
                    route,
                    model: model.name(),
                };
                self.fail_stream(stream_id, &e);
            }
            (Err(e), _) => self.fail_stream(stream_id, &e),
        }
    }

    /// Whether a FOLLOWS fragment opening a new chain has somewhere to go.
    fn expects_chain(&self, frame: &Frame) -> bool {
        if frame.frame_type.is_request() {
            return Side::of(frame.stream_id) == self.side.peer();
        }
        self.table().contains(frame.stream_id)
    }

    /// Give up on a stream whose inbound value was lost.
    ///
    /// The local consumer gets `e`; the peer gets CANCEL when we only
    /// request, ERROR otherwise.
    fn abort_stream(&self, stream_id: u32, e: RSocketError) {
        let frame = {
            let mut table = self.table();
            let Some(mut entry) = table.remove(stream_id) else {
                return;
            };
            let frame = if entry.machine.role() == Role::Requester
                && entry.machine.model() != InteractionModel::RequestChannel
            {
                Frame::cancel(stream_id)
            } else {
                Frame::error_from(stream_id, &e)
            };
            entry.machine.fail();
            entry.cancel.cancel();
            entry.sink.deliver(Err(e));
            frame
        };
        debug!(stream_id, "Aborted stream");
        self.send_detached(&frame);
    }

    /// Send ERROR on a stream we serve from the reader task.
    fn fail_stream(&self, stream_id: u32, e: &RSocketError) {
        let frame = Frame::error_from(stream_id, e);
        if self.account_send(&frame).is_ok() {
            self.send_detached(&frame);
        }
    }

    /// Run a response handler and send its reply.
    async fn respond(
        self: Arc<Self>,
        stream_id: u32,
        fut: BoxFuture<'static, Result<Payload>>,
        cancel: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(stream_id, "Response cancelled");
                return;
            }
            result = fut => result,
        };
        let frame = match result {
            Ok(payload) => Frame::next(stream_id, payload, true),
            Err(e) => {
                Counters::bump(&self.counters.handler_failures);
                warn!(stream_id, error = %e, "Response handler failed");
                Frame::error_from(stream_id, &e)
            }
        };
        if let Err(e) = self.emit(frame).await {
            debug!(stream_id, error = %e, "Reply not sent");
        }
    }

    /// Pull values from `source` and send each one once credit allows.
    ///
    /// A value is pulled before credit is awaited, so at most one value sits
    /// in hand while the stream is starved.
    async fn produce(
        self: Arc<Self>,
        stream_id: u32,
        mut source: PayloadSource,
        gate: Arc<CreditGate>,
        cancel: CancellationToken,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = source.next() => item,
            };
            let frame = match item {
                Some(Ok(payload)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = gate.acquire() => {}
                    }
                    Frame::next(stream_id, payload, false)
                }
                Some(Err(e)) => {
                    Counters::bump(&self.counters.handler_failures);
                    warn!(stream_id, error = %e, "Stream source failed");
                    Frame::error_from(stream_id, &e)
                }
                None => Frame::complete(stream_id),
            };
            let last = frame.frame_type != FrameType::Payload;
            if let Err(e) = self.emit(frame).await {
                debug!(stream_id, error = %e, "Producer stopped");
                break;
            }
            if last {
                break;
            }
        }
        debug!(stream_id, "Producer finished");
    }

    /// Deliver a non-request frame to its stream.
    fn route_to_stream(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        let mut table = self.table();
        let Ok(entry) = table.lookup(stream_id) else {
            Counters::bump(&self.counters.orphan_frames);
            if frame.frame_type == FrameType::Payload {
                warn!(stream_id, "PAYLOAD for unknown stream");
            } else {
                debug!(stream_id, frame_type = %frame.frame_type, "Frame for unknown stream");
            }
            return;
        };

        let carries_value = frame.frame_type == FrameType::Payload && frame.is_next();
        let model = entry.machine.model();
        if carries_value
            && model.is_flow_controlled()
            && entry.machine.inbound_open()
            && !entry.inbound_credit.is_unbounded()
            && entry.inbound_credit.available() == 0
        {
            Counters::bump(&self.counters.flow_control_violations);
            let e = RSocketError::FlowControlViolation { stream_id };
            warn!(stream_id, error = %e, "PAYLOAD dropped");
            return;
        }

        let event = match entry.machine.on_receive(&frame) {
            Ok(event) => event,
            Err(e) => {
                Counters::bump(&self.counters.protocol_violations);
                warn!(stream_id, error = %e, "Protocol violation");
                return;
            }
        };

        match event {
            Event::Next { complete } => {
                if model.is_flow_controlled() {
                    entry.inbound_credit.consume();
                }
                match frame.into_payload() {
                    Ok(payload) => {
                        entry.sink.deliver(Ok(payload));
                    }
                    Err(e) => {
                        entry.sink.deliver(Err(e));
                    }
                }
                if complete {
                    entry.sink.finish();
                }
            }
            Event::Complete => entry.sink.finish(),
            Event::RequestN(n) => {
                if let Some(gate) = &entry.outbound_credit {
                    gate.grant(n);
                }
            }
            Event::Cancel => {
                debug!(stream_id, "Peer cancelled stream");
                entry.cancel.cancel();
            }
            Event::Error => {
                let e = match frame.error_code {
                    error_code::CANCELED => RSocketError::Cancelled,
                    _ => frame.into_remote_error(),
                };
                debug!(stream_id, error = %e, "Peer failed stream");
                entry.sink.deliver(Err(e));
                entry.cancel.cancel();
            }
        }

        if entry.machine.is_terminal() {
            if let Some(entry) = table.remove(stream_id) {
                entry.cancel.cancel();
            }
            debug!(stream_id, "Stream finished");
        }
    }

    /// Fail every stream and stop all tasks. Safe to call more than once.
    fn terminate(&self, reason: &str) {
        let first = !self.closed.is_cancelled();
        self.closed.cancel();

        let entries = self.table().drain();
        let count = entries.len();
        for (_, mut entry) in entries {
            entry.machine.fail();
            entry.cancel.cancel();
            entry.sink.deliver(Err(RSocketError::ConnectionClosed));
        }
        if first {
            info!(reason, streams = count, "Connection closed");
        }
    }
}

impl InboundControl for Shared {
    fn request(&self, stream_id: u32, n: u32) {
        let frame = Frame::request_n(stream_id, n);
        {
            let mut table = self.table();
            let Ok(entry) = table.lookup(stream_id) else {
                return;
            };
            if entry.machine.on_send(&frame).is_err() {
                return;
            }
            entry.inbound_credit.grant(frame.request_n);
        }
        self.send_detached(&frame);
    }

    fn cancel(&self, stream_id: u32) {
        let frame = Frame::cancel(stream_id);
        {
            let mut table = self.table();
            let Ok(entry) = table.lookup(stream_id) else {
                return;
            };
            if entry.machine.on_send(&frame).is_err() {
                return;
            }
            entry.sink = Sink::None;
            if entry.machine.is_terminal() {
                if let Some(entry) = table.remove(stream_id) {
                    entry.cancel.cancel();
                }
            }
        }
        debug!(stream_id, "Cancelled stream");
        self.send_detached(&frame);
    }
}

/// Read, decode and dispatch frames until EOF, close, or a fatal error.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let result = read_frames(&shared, &mut reader).await;
    match &result {
        Ok(()) => shared.terminate("peer closed the connection"),
        Err(RSocketError::Remote { code, .. }) if *code == error_code::CONNECTION_CLOSE => {
            shared.terminate("peer closed the connection");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Connection failed");
            shared.terminate("connection error");
        }
    }
    result
}

async fn read_frames<R>(shared: &Arc<Shared>, reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame(shared.config.max_frame_size);
    let mut reassembler = Reassembler::new(shared.config.max_frame_size as usize);
    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = shared.closed.cancelled() => return Ok(()),
            n = reader.read(&mut read_buf) => n?,
        };
        if n == 0 {
            debug!(unfinished_chains = reassembler.pending(), "EOF on transport");
            return Ok(());
        }

        for frame in frame_buffer.push(&read_buf[..n])? {
            shared.touch();
            let stream_id = frame.stream_id;
            if frame.follows()
                && !reassembler.in_chain(stream_id)
                && !shared.expects_chain(&frame)
            {
                Counters::bump(&shared.counters.orphan_frames);
                debug!(stream_id, "Fragment for unknown stream");
                continue;
            }
            let is_error = frame.frame_type == FrameType::Error;
            let frame = match reassembler.accept(frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    Counters::bump(&shared.counters.protocol_violations);
                    warn!(stream_id, error = %e, "Bad fragment, chain dropped");
                    shared.abort_stream(stream_id, e);
                    continue;
                }
            };
            if is_error {
                reassembler.discard(stream_id);
            }
            shared.handle_frame(frame)?;
            if reassembler.in_chain(stream_id) && !shared.table().contains(stream_id) {
                reassembler.discard(stream_id);
            }
        }
    }
}

/// Tear the connection down if the writer task stops on its own.
async fn watch_writer(shared: Arc<Shared>, task: JoinHandle<Result<()>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Writer failed"),
        Err(e) => error!(error = %e, "Writer task panicked"),
    }
    shared.terminate("writer stopped");
}

/// Client keepalive: ping every interval, give up after `max_lifetime` of silence.
async fn keepalive_loop(shared: Arc<Shared>) {
    let interval = shared.config.setup.keepalive_interval;
    let max_lifetime = shared.config.setup.max_lifetime;
    if interval.is_zero() {
        return;
    }

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let silent = lock(&shared.last_received).elapsed();
        if silent > max_lifetime {
            warn!(silent_ms = silent.as_millis() as u64, "Keepalive timeout");
            shared.terminate("keepalive timeout");
            return;
        }
        shared.send_detached(&Frame::keepalive(true, Bytes::new()));
    }
}
