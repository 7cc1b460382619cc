//! Consumer side of a multi-valued stream.
//!
//! [`PayloadStream`] is what request-stream and request-channel requesters
//! get back, and what channel handlers receive as their input. It yields
//! values as they arrive, lets the consumer grant more demand, and cancels
//! the remote producer when dropped before the end.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::payload::Payload;

/// Connection hooks a [`PayloadStream`] uses to talk back to the producer.
pub(crate) trait InboundControl: Send + Sync {
    /// Grant `n` more credits (REQUEST_N).
    fn request(&self, stream_id: u32, n: u32);
    /// Stop the remote producer (CANCEL).
    fn cancel(&self, stream_id: u32);
}

/// Automatic REQUEST_N policy: top credit back up to `batch` once half of it
/// has been consumed.
#[derive(Debug, Clone, Copy)]
struct Replenish {
    batch: u32,
    consumed: u32,
}

/// Values arriving on one stream.
pub struct PayloadStream {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<Result<Payload>>,
    control: Option<Arc<dyn InboundControl>>,
    replenish: Option<Replenish>,
    finished: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<Result<Payload>>,
        control: Arc<dyn InboundControl>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            control: Some(control),
            replenish: None,
            finished: false,
        }
    }

    /// Stream over fixed values, not attached to any connection.
    ///
    /// Handy for exercising channel handlers directly.
    pub fn from_payloads(payloads: impl IntoIterator<Item = Payload>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for payload in payloads {
            let _ = tx.send(Ok(payload));
        }
        Self {
            stream_id: 0,
            rx,
            control: None,
            replenish: None,
            finished: false,
        }
    }

    /// Grant `batch` credits again each time half of them have been used.
    ///
    /// `batch` should match the credit initially granted to the producer.
    pub fn auto_replenish(mut self, batch: u32) -> Self {
        if batch > 0 {
            self.replenish = Some(Replenish { batch, consumed: 0 });
        }
        self
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Ask the producer for `n` more values.
    pub fn request(&self, n: u32) {
        if n == 0 || self.finished {
            return;
        }
        if let Some(control) = &self.control {
            control.request(self.stream_id, n);
        }
    }

    /// Tell the producer to stop. Values already in flight are discarded.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rx.close();
        if let Some(control) = &self.control {
            control.cancel(self.stream_id);
        }
    }

    fn on_value(&mut self) {
        let Some(replenish) = self.replenish.as_mut() else {
            return;
        };
        replenish.consumed += 1;
        let threshold = (replenish.batch / 2).max(1);
        if replenish.consumed >= threshold {
            let n = replenish.consumed;
            replenish.consumed = 0;
            self.request(n);
        }
    }
}

impl Stream for PayloadStream {
    type Item = Result<Payload>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(payload))) => {
                self.on_value();
                Poll::Ready(Some(Ok(payload)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStream")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish()
    }
}
