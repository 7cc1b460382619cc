//! Stream table: id allocation and per-stream bookkeeping.
//!
//! The table is owned by the connection behind a single mutex; the receive
//! path and local request issuance both go through it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::state::StreamMachine;
use crate::error::{RSocketError, Result};
use crate::flow::{Credit, CreditGate};
use crate::payload::Payload;
use crate::protocol::MAX_STREAM_ID;

/// Which end of the connection allocates an id.
///
/// Clients use odd ids and servers even ids, so the two never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Side that owns `stream_id`.
    pub fn of(stream_id: u32) -> Side {
        if stream_id % 2 == 1 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    #[inline]
    fn first_id(self) -> u32 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }

    /// How many ids of this parity exist up to `max_id`.
    fn capacity(self, max_id: u32) -> usize {
        match self {
            Side::Client => (max_id as usize + 1) / 2,
            Side::Server => max_id as usize / 2,
        }
    }
}

/// Where inbound values for a locally requested stream go.
#[derive(Debug)]
pub enum Sink {
    /// Responder streams and fire-and-forget: nothing waits locally.
    None,
    /// Request-response: one result.
    Single(Option<oneshot::Sender<Result<Payload>>>),
    /// Request-stream and request-channel: a sequence of results.
    Many(mpsc::UnboundedSender<Result<Payload>>),
}

impl Sink {
    /// Hand a value (or failure) to the local consumer.
    ///
    /// Returns `false` when the consumer has gone away.
    pub fn deliver(&mut self, item: Result<Payload>) -> bool {
        match self {
            Sink::None => false,
            Sink::Single(sender) => match sender.take() {
                Some(sender) => sender.send(item).is_ok(),
                None => false,
            },
            Sink::Many(sender) => sender.send(item).is_ok(),
        }
    }

    /// Signal the end of values without an error.
    pub fn finish(&mut self) {
        *self = Sink::None;
    }
}

/// Everything the connection knows about one open stream.
#[derive(Debug)]
pub struct StreamEntry {
    pub machine: StreamMachine,
    /// Credit we granted the peer.
    pub inbound_credit: Credit,
    /// Credit the peer granted us, shared with the producer task.
    pub outbound_credit: Option<Arc<CreditGate>>,
    pub sink: Sink,
    /// Cancels the local producer or handler for this stream.
    pub cancel: CancellationToken,
}

impl StreamEntry {
    pub fn new(machine: StreamMachine) -> Self {
        Self {
            machine,
            inbound_credit: Credit::new(0),
            outbound_credit: None,
            sink: Sink::None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_inbound_credit(mut self, credit: Credit) -> Self {
        self.inbound_credit = credit;
        self
    }

    pub fn with_outbound_credit(mut self, gate: Arc<CreditGate>) -> Self {
        self.outbound_credit = Some(gate);
        self
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Open streams keyed by id.
#[derive(Debug)]
pub struct StreamTable {
    streams: HashMap<u32, StreamEntry>,
    next_id: [u32; 2],
    open: [usize; 2],
    max_id: u32,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::with_max_id(MAX_STREAM_ID)
    }

    /// Table whose ids wrap at `max_id` instead of 2^31-1.
    pub fn with_max_id(max_id: u32) -> Self {
        Self {
            streams: HashMap::new(),
            next_id: [Side::Client.first_id(), Side::Server.first_id()],
            open: [0, 0],
            max_id,
        }
    }

    /// Next unused id of `side`'s parity.
    ///
    /// Ids wrap at the maximum and skip streams that are still open.
    /// The id is not reserved until [`StreamTable::insert`].
    pub fn allocate(&mut self, side: Side) -> Result<u32> {
        if self.open[side.index()] >= side.capacity(self.max_id) {
            return Err(RSocketError::IdSpaceExhausted);
        }
        loop {
            let id = self.next_id[side.index()];
            let mut following = id.wrapping_add(2);
            if following > self.max_id || following < id {
                following = side.first_id();
            }
            self.next_id[side.index()] = following;
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    pub fn insert(&mut self, stream_id: u32, entry: StreamEntry) -> Result<()> {
        if self.streams.contains_key(&stream_id) {
            return Err(RSocketError::violation(stream_id, "stream id already in use"));
        }
        self.streams.insert(stream_id, entry);
        self.open[Side::of(stream_id).index()] += 1;
        Ok(())
    }

    pub fn lookup(&mut self, stream_id: u32) -> Result<&mut StreamEntry> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(RSocketError::StreamNotFound(stream_id))
    }

    /// Remove a stream. Removing an unknown id is a no-op.
    pub fn remove(&mut self, stream_id: u32) -> Option<StreamEntry> {
        let entry = self.streams.remove(&stream_id)?;
        self.open[Side::of(stream_id).index()] -= 1;
        Some(entry)
    }

    #[inline]
    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Take every stream out of the table (connection teardown).
    pub fn drain(&mut self) -> Vec<(u32, StreamEntry)> {
        self.open = [0, 0];
        self.streams.drain().collect()
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::state::{InteractionModel, Role};

    fn entry() -> StreamEntry {
        StreamEntry::new(StreamMachine::new(
            InteractionModel::RequestStream,
            Role::Requester,
            0,
        ))
    }

    #[test]
    fn test_parity() {
        let mut table = StreamTable::new();
        let a = table.allocate(Side::Client).unwrap();
        table.insert(a, entry()).unwrap();
        let b = table.allocate(Side::Client).unwrap();
        assert_eq!((a, b), (1, 3));

        let c = table.allocate(Side::Server).unwrap();
        assert_eq!(c, 2);
        assert_eq!(Side::of(c), Side::Server);
    }

    #[test]
    fn test_wraps_and_skips_open_ids() {
        let mut table = StreamTable::with_max_id(7);
        for expected in [1, 3, 5, 7] {
            let id = table.allocate(Side::Client).unwrap();
            assert_eq!(id, expected);
            table.insert(id, entry()).unwrap();
        }
        assert!(matches!(
            table.allocate(Side::Client),
            Err(RSocketError::IdSpaceExhausted)
        ));

        table.remove(5);
        assert_eq!(table.allocate(Side::Client).unwrap(), 5);
    }

    #[test]
    fn test_server_capacity() {
        let mut table = StreamTable::with_max_id(7);
        for expected in [2, 4, 6] {
            let id = table.allocate(Side::Server).unwrap();
            assert_eq!(id, expected);
            table.insert(id, entry()).unwrap();
        }
        assert!(table.allocate(Side::Server).is_err());
        assert!(table.allocate(Side::Client).is_ok());
    }

    #[test]
    fn test_lookup_after_remove() {
        let mut table = StreamTable::new();
        table.insert(9, entry()).unwrap();
        assert!(table.lookup(9).is_ok());

        assert!(table.remove(9).is_some());
        assert!(table.remove(9).is_none());
        assert!(matches!(
            table.lookup(9),
            Err(RSocketError::StreamNotFound(9))
        ));
    }

    #[test]
    fn test_duplicate_insert() {
        let mut table = StreamTable::new();
        table.insert(2, entry()).unwrap();
        assert!(table.insert(2, entry()).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = StreamTable::new();
        table.insert(1, entry()).unwrap();
        table.insert(2, entry()).unwrap();
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
        assert_eq!(table.allocate(Side::Client).unwrap(), 1);
    }

    #[test]
    fn test_finish_closes_many_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = Sink::Many(tx);
        assert!(sink.deliver(Ok(Payload::from("last"))));
        sink.finish();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Payload::from("last"));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
