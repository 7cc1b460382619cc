//! Integration tests for rsocket-mux.
//!
//! Two kinds of peers drive a real `Connection` over `tokio::io::duplex`:
//! another `Connection`, or a raw peer that writes and reads frames directly
//! so exact wire behavior can be asserted.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use rsocket_mux::protocol::{
    error_code, flags, fragment, Frame, FrameBuffer, FrameType, SetupParams,
};
use rsocket_mux::{Connection, ConnectionBuilder, Payload, RSocketError, StreamState};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// Frame-level peer.
struct RawPeer {
    io: DuplexStream,
    buffer: FrameBuffer,
    queued: VecDeque<Frame>,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: FrameBuffer::new(),
            queued: VecDeque::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.io.write_all(&frame.encode()).await.unwrap();
    }

    /// Next frame, or `None` if nothing arrives within `wait` or on EOF.
    async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            let n = match timeout(wait, self.io.read(&mut buf)).await {
                Ok(read) => read.unwrap(),
                Err(_) => return None,
            };
            if n == 0 {
                return None;
            }
            self.queued.extend(self.buffer.push(&buf[..n]).unwrap());
        }
    }

    async fn recv(&mut self) -> Frame {
        self.try_recv(WAIT).await.expect("expected a frame")
    }

    /// Round-trip a KEEPALIVE so everything sent before it has been read by
    /// the other side. Returns the frames that arrived ahead of the answer.
    async fn sync(&mut self) -> Vec<Frame> {
        self.send(Frame::keepalive(true, Bytes::from_static(b"sync")))
            .await;
        let mut before = Vec::new();
        loop {
            let frame = self.recv().await;
            if frame.frame_type == FrameType::Keepalive {
                assert_eq!(frame.data, Bytes::from_static(b"sync"));
                return before;
            }
            before.push(frame);
        }
    }
}

async fn serve_raw(builder: ConnectionBuilder) -> (Connection, RawPeer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = builder.start(a).await.unwrap();
    (server, RawPeer::new(b))
}

async fn pair(server: ConnectionBuilder) -> (Connection, Connection) {
    pair_with(ConnectionBuilder::client().disable_keepalive(), server).await
}

async fn pair_with(client: ConnectionBuilder, server: ConnectionBuilder) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = server.start(b).await.unwrap();
    let client = client.start(a).await.unwrap();
    (client, server)
}

fn greeting_server() -> ConnectionBuilder {
    ConnectionBuilder::server()
        .response("greeting", |_p, _ctx| async move {
            Ok(Payload::from("Hello back to you!"))
        })
        .response("greeting/{name}", |_p, ctx| async move {
            let name = ctx.variable("name").unwrap_or("there").to_string();
            Ok(Payload::from(format!("Hello {}!", name)))
        })
}

fn counting_stream() -> impl futures::Stream<Item = rsocket_mux::Result<Payload>> {
    stream::iter((0u64..).map(|i| Ok(Payload::from(i.to_string()))))
}

fn stock_server() -> ConnectionBuilder {
    ConnectionBuilder::server().stream("stock/{symbol}", |_p, _ctx| counting_stream())
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Wire-level scenarios
// ============================================================================

/// A request-response gets exactly one PAYLOAD(NEXT|COMPLETE).
#[tokio::test]
async fn test_greeting_request_response() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    peer.send(Frame::request_response(1, "greeting", Payload::from("Hello Rsocket!")).unwrap())
        .await;

    let reply = peer.recv().await;
    assert_eq!(reply.stream_id, 1);
    assert_eq!(reply.frame_type, FrameType::Payload);
    assert!(flags::has_flag(reply.flags, flags::NEXT_COMPLETE));
    assert_eq!(reply.data, Bytes::from_static(b"Hello back to you!"));

    assert!(peer.try_recv(QUIET).await.is_none());
    assert_eq!(server.active_streams(), 0);
}

/// An unbounded producer sends no more than the credit granted.
#[tokio::test]
async fn test_stream_respects_initial_credit() {
    let (server, mut peer) = serve_raw(stock_server()).await;

    peer.send(Frame::request_stream(1, "stock/xyz", Payload::empty(), 2).unwrap())
        .await;

    for expected in ["0", "1"] {
        let frame = peer.recv().await;
        assert_eq!(frame.frame_type, FrameType::Payload);
        assert!(frame.is_next());
        assert!(!frame.is_complete());
        assert_eq!(frame.data, Bytes::from(expected));
    }
    assert!(peer.try_recv(QUIET).await.is_none());
    assert_eq!(server.stream_state(1), Some(StreamState::Streaming));

    peer.send(Frame::request_n(1, 3)).await;
    for expected in ["2", "3", "4"] {
        assert_eq!(peer.recv().await.data, Bytes::from(expected));
    }
    assert!(peer.try_recv(QUIET).await.is_none());
}

/// CANCEL stops the producer and forgets the stream.
#[tokio::test]
async fn test_cancel_after_first_payload() {
    let (server, mut peer) = serve_raw(stock_server()).await;

    peer.send(Frame::request_stream(1, "stock/xyz", Payload::empty(), 1).unwrap())
        .await;
    assert_eq!(peer.recv().await.data, Bytes::from("0"));

    peer.send(Frame::cancel(1)).await;
    assert!(peer.sync().await.is_empty());
    assert_eq!(server.stream_state(1), None);
    assert_eq!(server.active_streams(), 0);

    // credit after cancel has nowhere to go
    peer.send(Frame::request_n(1, 5)).await;
    assert!(peer.sync().await.is_empty());
    assert!(peer.try_recv(QUIET).await.is_none());
    assert_eq!(server.stats().orphan_frames, 1);
}

/// Fire-and-forget to an unknown route produces no frame at all.
#[tokio::test]
async fn test_fire_and_forget_unknown_route_is_silent() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    peer.send(Frame::request_fnf(1, "nowhere", Payload::from("x")).unwrap())
        .await;

    assert!(peer.sync().await.is_empty());
    assert_eq!(server.stats().no_such_route, 1);
}

#[tokio::test]
async fn test_request_response_unknown_route_is_invalid() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    peer.send(Frame::request_response(1, "nowhere", Payload::empty()).unwrap())
        .await;

    let frame = peer.recv().await;
    assert_eq!(frame.stream_id, 1);
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error_code, error_code::INVALID);
    assert_eq!(server.stats().no_such_route, 1);
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn test_model_mismatch_is_invalid() {
    let (_server, mut peer) = serve_raw(stock_server()).await;

    peer.send(Frame::request_response(1, "stock/xyz", Payload::empty()).unwrap())
        .await;

    let frame = peer.recv().await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error_code, error_code::INVALID);
}

/// A response handler serves a stream request with one value.
#[tokio::test]
async fn test_response_handler_serves_stream() {
    let (_server, mut peer) = serve_raw(greeting_server()).await;

    peer.send(Frame::request_stream(1, "greeting", Payload::empty(), 4).unwrap())
        .await;

    let value = peer.recv().await;
    assert!(value.is_next());
    assert_eq!(value.data, Bytes::from_static(b"Hello back to you!"));
    assert_eq!(peer.recv().await.frame_type, FrameType::Complete);
}

#[tokio::test]
async fn test_setup_is_recorded() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    let setup = SetupParams {
        data_mime_type: "application/octet-stream".into(),
        ..SetupParams::default()
    };
    peer.send(Frame::setup(setup.clone())).await;
    peer.sync().await;

    assert_eq!(server.peer_setup(), Some(setup));
}

#[tokio::test]
async fn test_unsupported_setup_version_closes() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    let setup = SetupParams {
        major_version: 2,
        ..SetupParams::default()
    };
    peer.send(Frame::setup(setup)).await;

    let frame = peer.recv().await;
    assert_eq!(frame.stream_id, 0);
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error_code, error_code::UNSUPPORTED_SETUP);

    assert!(peer.try_recv(WAIT).await.is_none());
    assert!(server.wait_for_shutdown().await.is_err());
}

#[tokio::test]
async fn test_malformed_input_closes() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    // length 6, stream 1, unknown frame type 0x3F
    peer.io
        .write_all(&[0, 0, 0, 6, 0, 0, 0, 1, 0x3F, 0])
        .await
        .unwrap();

    assert!(peer.try_recv(WAIT).await.is_none());
    assert!(server.wait_for_shutdown().await.is_err());
}

/// Frames beyond the credit we granted are dropped and counted.
#[tokio::test]
async fn test_payload_beyond_credit_is_dropped() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = ConnectionBuilder::client()
        .disable_keepalive()
        .start(a)
        .await
        .unwrap();
    let mut peer = RawPeer::new(b);
    assert_eq!(peer.recv().await.frame_type, FrameType::Setup);

    let mut values = client
        .request_stream("numbers", Payload::empty(), 2)
        .await
        .unwrap();
    let request = peer.recv().await;
    assert_eq!(request.frame_type, FrameType::RequestStream);
    assert_eq!(request.request_n, 2);
    assert_eq!(request.route().unwrap().as_deref(), Some("numbers"));

    for data in ["a", "b", "c"] {
        peer.send(Frame::next(request.stream_id, Payload::from(data), false))
            .await;
    }
    peer.send(Frame::complete(request.stream_id)).await;

    let mut received = Vec::new();
    while let Some(value) = timeout(WAIT, values.next()).await.unwrap() {
        received.push(value.unwrap().data);
    }
    assert_eq!(received, vec![Bytes::from("a"), Bytes::from("b")]);
    assert_eq!(client.stats().flow_control_violations, 1);
}

#[tokio::test]
async fn test_payload_for_unknown_stream_is_orphan() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    peer.send(Frame::next(99, Payload::from("lost"), false)).await;
    assert!(peer.sync().await.is_empty());
    assert_eq!(server.stats().orphan_frames, 1);
}

#[tokio::test]
async fn test_channel_request_with_complete_flag() {
    let (server, mut peer) = serve_raw(
        ConnectionBuilder::server().channel("count-in", |inbound, _ctx| {
            stream::once(async move {
                let n = inbound.count().await;
                Ok(Payload::from(n.to_string()))
            })
        }),
    )
    .await;

    peer.send(Frame::request_channel(1, "count-in", Payload::from("only"), 4, true).unwrap())
        .await;

    // the requester is done, so no REQUEST_N comes back
    let value = peer.recv().await;
    assert_eq!(value.frame_type, FrameType::Payload);
    assert_eq!(value.data, Bytes::from("1"));
    assert_eq!(peer.recv().await.frame_type, FrameType::Complete);
    assert!(peer.try_recv(QUIET).await.is_none());
    assert_eq!(server.active_streams(), 0);
}

/// A reply bigger than our frame limit, sent in fragments, is never handed
/// over piecemeal: the request fails and the peer is told to stop.
#[tokio::test]
async fn test_oversized_fragment_chain_aborts_request() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = ConnectionBuilder::client()
        .disable_keepalive()
        .max_frame_size(128)
        .start(a)
        .await
        .unwrap();
    let mut peer = RawPeer::new(b);
    assert_eq!(peer.recv().await.frame_type, FrameType::Setup);

    let reply = tokio::spawn(async move {
        let result = client.request_response("big", Payload::empty()).await;
        (client, result)
    });
    let request = peer.recv().await;
    assert_eq!(request.frame_type, FrameType::RequestResponse);

    let value = Frame::next(request.stream_id, Payload::from("z".repeat(400)), true);
    let pieces = fragment(value, 48);
    assert!(pieces.len() > 3);
    for piece in pieces {
        peer.send(piece).await;
    }

    let (client, result) = timeout(WAIT, reply).await.unwrap().unwrap();
    assert!(matches!(result, Err(RSocketError::ProtocolViolation { .. })));

    let sent = peer.sync().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].frame_type, FrameType::Cancel);
    assert_eq!(sent[0].stream_id, request.stream_id);

    let stats = client.stats();
    assert_eq!(stats.protocol_violations, 1);
    assert_eq!(stats.orphan_frames, 0);
    assert_eq!(client.active_streams(), 0);
}

/// Continuation fragments for streams that were never opened are dropped
/// on arrival instead of being buffered.
#[tokio::test]
async fn test_fragments_for_unknown_streams_are_dropped() {
    let (server, mut peer) = serve_raw(greeting_server()).await;

    for i in 0..100u32 {
        let mut piece = Frame::next(2 * i + 101, Payload::from("partial"), false);
        piece.flags |= flags::FOLLOWS;
        peer.send(piece).await;
    }
    assert!(peer.sync().await.is_empty());
    assert_eq!(server.stats().orphan_frames, 100);

    peer.send(Frame::request_response(1, "greeting", Payload::empty()).unwrap())
        .await;
    assert_eq!(peer.recv().await.data, Bytes::from_static(b"Hello back to you!"));
}

/// A bare COMPLETE is not a request-response reply.
#[tokio::test]
async fn test_bare_complete_does_not_answer_request_response() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = ConnectionBuilder::client()
        .disable_keepalive()
        .start(a)
        .await
        .unwrap();
    let mut peer = RawPeer::new(b);
    assert_eq!(peer.recv().await.frame_type, FrameType::Setup);

    let reply = tokio::spawn(async move {
        let result = client.request_response("greeting", Payload::empty()).await;
        (client, result)
    });
    let request = peer.recv().await;

    peer.send(Frame::complete(request.stream_id)).await;
    assert!(peer.sync().await.is_empty());

    peer.send(Frame::next(request.stream_id, Payload::from("hi"), true))
        .await;
    let (client, result) = timeout(WAIT, reply).await.unwrap().unwrap();
    assert_eq!(result.unwrap().data, Bytes::from_static(b"hi"));
    assert_eq!(client.stats().protocol_violations, 1);
}

// ============================================================================
// Connection to connection
// ============================================================================

#[tokio::test]
async fn test_request_response_roundtrip() {
    let (client, _server) = pair(greeting_server()).await;

    let reply = client
        .request_response("greeting", Payload::from("Hello Rsocket!"))
        .await
        .unwrap();
    assert_eq!(reply.data_utf8().unwrap(), "Hello back to you!");

    let reply = client
        .request_response("greeting/Jeff", Payload::empty())
        .await
        .unwrap();
    assert_eq!(reply.data_utf8().unwrap(), "Hello Jeff!");
    assert_eq!(client.active_streams(), 0);
}

#[tokio::test]
async fn test_handler_failure_reaches_requester() {
    let (client, server) = pair(ConnectionBuilder::server().response("broken", |_p, _ctx| async move {
        Err::<Payload, _>(RSocketError::handler("boom"))
    }))
    .await;

    let err = client
        .request_response("broken", Payload::empty())
        .await
        .unwrap_err();
    match err {
        RSocketError::Remote { code, message } => {
            assert_eq!(code, error_code::APPLICATION_ERROR);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(server.stats().handler_failures, 1);
}

#[tokio::test]
async fn test_fire_and_forget_delivery() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (client, _server) = pair(ConnectionBuilder::server().fire_and_forget(
        "alert",
        move |p, _ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(p.data);
                Ok(())
            }
        },
    ))
    .await;

    client
        .fire_and_forget("alert", Payload::from("disk full"))
        .await
        .unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Bytes::from("disk full"));
    assert_eq!(client.active_streams(), 0);
}

/// Values received never exceed the credit granted.
#[tokio::test]
async fn test_stream_credit_is_never_exceeded() {
    let (client, _server) = pair(stock_server()).await;

    let mut quotes = client
        .request_stream("stock/xyz", Payload::empty(), 5)
        .await
        .unwrap();

    for i in 0..5 {
        let value = timeout(WAIT, quotes.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(value.data_utf8().unwrap(), i.to_string());
    }
    assert!(timeout(QUIET, quotes.next()).await.is_err());

    quotes.request(2);
    for i in 5..7 {
        let value = timeout(WAIT, quotes.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(value.data_utf8().unwrap(), i.to_string());
    }
    assert!(timeout(QUIET, quotes.next()).await.is_err());
}

#[tokio::test]
async fn test_auto_replenish_keeps_stream_flowing() {
    let (client, _server) = pair(stock_server()).await;

    let quotes = client
        .request_stream("stock/xyz", Payload::empty(), 4)
        .await
        .unwrap()
        .auto_replenish(4);

    let values: Vec<_> = timeout(WAIT, quotes.take(50).collect::<Vec<_>>())
        .await
        .unwrap();
    assert_eq!(values.len(), 50);
    assert!(values.iter().all(|v| v.is_ok()));
}

#[tokio::test]
async fn test_dropping_stream_cancels_producer() {
    let (client, server) = pair(stock_server()).await;

    let mut quotes = client
        .request_stream("stock/xyz", Payload::empty(), 1)
        .await
        .unwrap();
    timeout(WAIT, quotes.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(server.active_streams(), 1);

    drop(quotes);
    assert_eq!(client.active_streams(), 0);
    eventually(|| server.active_streams() == 0).await;
}

#[tokio::test]
async fn test_dropping_response_future_cancels() {
    let (client, server) = pair(ConnectionBuilder::server().response("slow", |_p, _ctx| async move {
        futures::future::pending::<()>().await;
        Ok(Payload::empty())
    }))
    .await;

    let result = timeout(QUIET, client.request_response("slow", Payload::empty())).await;
    assert!(result.is_err());
    assert_eq!(client.active_streams(), 0);
    eventually(|| server.active_streams() == 0).await;
}

#[tokio::test]
async fn test_channel_echo() {
    let (client, server) = pair(ConnectionBuilder::server().channel("echo", |inbound, _ctx| inbound)).await;

    let outbound = stream::iter((1..=5).map(|i| Ok(Payload::from(format!("msg-{}", i)))));
    let echoed = client.request_channel("echo", outbound, 8).await.unwrap();

    let values: Vec<String> = timeout(WAIT, echoed.collect::<Vec<_>>())
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap().data_utf8().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["msg-1", "msg-2", "msg-3", "msg-4", "msg-5"]);

    assert_eq!(client.active_streams(), 0);
    eventually(|| server.active_streams() == 0).await;
}

#[tokio::test]
async fn test_channel_requires_first_payload() {
    let (client, _server) = pair(ConnectionBuilder::server().channel("echo", |inbound, _ctx| inbound)).await;

    let result = client
        .request_channel("echo", stream::empty::<rsocket_mux::Result<Payload>>(), 8)
        .await;
    assert!(matches!(result, Err(RSocketError::Protocol(_))));
    assert_eq!(client.active_streams(), 0);
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Bill {
    total: f64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Tip {
    amount: f64,
}

/// JSON values flow both ways through a channel, many more than one credit batch.
#[tokio::test]
async fn test_gratuity_channel() {
    let (client, _server) = pair(
        ConnectionBuilder::server()
            .channel_request_n(4)
            .channel("gratuity", |inbound, _ctx| {
                inbound.map(|item| {
                    let bill: Bill = item?.decode_json()?;
                    Payload::json(&Tip {
                        amount: bill.total * 0.15,
                    })
                })
            }),
    )
    .await;

    let bills = stream::iter((1..=20).map(|i| Payload::json(&Bill { total: i as f64 * 100.0 })));
    let tips = client
        .request_channel("gratuity", bills, 20)
        .await
        .unwrap();

    let tips: Vec<Tip> = timeout(WAIT, tips.collect::<Vec<_>>())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.unwrap().decode_json().unwrap())
        .collect();
    assert_eq!(tips.len(), 20);
    assert_eq!(tips[0], Tip { amount: 15.0 });
    assert_eq!(tips[19], Tip { amount: 300.0 });
}

#[tokio::test]
async fn test_json_route() {
    let (client, _server) = pair(ConnectionBuilder::server().json(
        "tip",
        |bill: Bill, _ctx| async move {
            Ok(Tip {
                amount: bill.total * 0.2,
            })
        },
    ))
    .await;

    let reply = client
        .request_response("tip", Payload::json(&Bill { total: 50.0 }).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.decode_json::<Tip>().unwrap(), Tip { amount: 10.0 });
}

/// A starved stream does not hold up other streams on the connection.
#[tokio::test]
async fn test_frozen_stream_does_not_block_channel() {
    let (client, _server) = pair(
        stock_server().channel("echo", |inbound, _ctx| inbound),
    )
    .await;

    let mut frozen = client
        .request_stream("stock/xyz", Payload::empty(), 1)
        .await
        .unwrap();
    timeout(WAIT, frozen.next()).await.unwrap().unwrap().unwrap();

    let outbound = stream::iter((0..100).map(|i| Ok(Payload::from(i.to_string()))));
    let echoed = client.request_channel("echo", outbound, 1000).await.unwrap();
    let count = timeout(WAIT, echoed.count()).await.unwrap();
    assert_eq!(count, 100);

    assert!(timeout(QUIET, frozen.next()).await.is_err());
}

#[tokio::test]
async fn test_large_payloads_are_fragmented() {
    let (client, _server) = pair_with(
        ConnectionBuilder::client().disable_keepalive().fragment_mtu(64),
        ConnectionBuilder::server()
            .fragment_mtu(64)
            .response("echo", |p, _ctx| async move { Ok(p) }),
    )
    .await;

    let big = Payload::with_metadata(vec![7u8; 1000], Bytes::from(vec![1u8; 200]));
    let reply = client.request_response("echo", big.clone()).await.unwrap();
    assert_eq!(reply, big);
}

#[tokio::test]
async fn test_requests_from_both_sides() {
    let (client, server) = pair_with(
        ConnectionBuilder::client()
            .disable_keepalive()
            .response("whoami", |_p, _ctx| async move { Ok(Payload::from("client")) }),
        greeting_server(),
    )
    .await;

    let (to_server, to_client) = tokio::join!(
        client.request_response("greeting", Payload::empty()),
        server.request_response("whoami", Payload::empty()),
    );
    assert_eq!(to_server.unwrap().data_utf8().unwrap(), "Hello back to you!");
    assert_eq!(to_client.unwrap().data_utf8().unwrap(), "client");
}

#[tokio::test]
async fn test_close_reaches_peer() {
    let (client, server) = pair(stock_server()).await;

    let mut quotes = client
        .request_stream("stock/xyz", Payload::empty(), 1)
        .await
        .unwrap();
    timeout(WAIT, quotes.next()).await.unwrap().unwrap().unwrap();

    client.close().await;
    assert!(matches!(
        quotes.next().await,
        Some(Err(RSocketError::ConnectionClosed))
    ));

    timeout(WAIT, server.closed()).await.unwrap();
    assert_eq!(server.active_streams(), 0);
    assert!(server.wait_for_shutdown().await.is_ok());
}

/// A reply too large for the frame limit fails the stream instead of
/// leaving the requester waiting.
#[tokio::test]
async fn test_oversized_reply_fails_stream() {
    let (client, server) = pair(
        ConnectionBuilder::server()
            .max_frame_size(1024)
            .response("report", |_p, _ctx| async move {
                Ok(Payload::from("r".repeat(4096)))
            }),
    )
    .await;

    let err = timeout(WAIT, client.request_response("report", Payload::empty()))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        RSocketError::Remote { code, message } => {
            assert_eq!(code, error_code::APPLICATION_ERROR);
            assert!(message.contains("1024"), "{}", message);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(server.active_streams(), 0);
    assert_eq!(server.stats().handler_failures, 1);
}

/// A stream item over the limit ends the stream with ERROR after the
/// values that did fit.
#[tokio::test]
async fn test_oversized_stream_item_fails_stream() {
    let (client, server) = pair(ConnectionBuilder::server().max_frame_size(256).stream(
        "report",
        |_p, _ctx| {
            stream::iter(vec![
                Ok(Payload::from("small")),
                Ok(Payload::from("r".repeat(1024))),
                Ok(Payload::from("never")),
            ])
        },
    ))
    .await;

    let mut values = client
        .request_stream("report", Payload::empty(), 8)
        .await
        .unwrap();
    let first = timeout(WAIT, values.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.data, Bytes::from_static(b"small"));
    let second = timeout(WAIT, values.next()).await.unwrap().unwrap();
    assert!(matches!(second, Err(RSocketError::Remote { .. })));
    assert!(timeout(WAIT, values.next()).await.unwrap().is_none());

    eventually(|| server.active_streams() == 0).await;
    assert_eq!(server.stats().handler_failures, 1);
}

/// A responder that gives up with `Cancelled` is seen as cancelled by the
/// requester.
#[tokio::test]
async fn test_cancelled_handler_reaches_requester() {
    let (client, _server) = pair(ConnectionBuilder::server().response(
        "shutdown",
        |_p, _ctx| async move { Err::<Payload, _>(RSocketError::Cancelled) },
    ))
    .await;

    let err = client
        .request_response("shutdown", Payload::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, RSocketError::Cancelled));
}

/// Queued frames are flushed by the time the peer has answered.
#[tokio::test]
async fn test_writer_queue_drains() {
    let (client, _server) = pair(greeting_server()).await;
    for _ in 0..20 {
        client
            .request_response("greeting", Payload::empty())
            .await
            .unwrap();
    }
    eventually(|| client.queued_frames() == 0).await;
}
