//! Request-n credit accounting.
//!
//! Every flow-controlled stream carries credit in two directions:
//!
//! - **Inbound** ([`Credit`]): demand the local consumer granted the peer.
//!   Decremented by each PAYLOAD(NEXT) received; a PAYLOAD arriving at zero
//!   is a flow-control violation.
//! - **Outbound** ([`CreditGate`]): demand the peer granted the local
//!   producer. Shared between the receive path (REQUEST_N adds credit) and
//!   the producer task (each PAYLOAD takes one), so it is lock-free and
//!   async-aware.
//!
//! Both counters saturate; a grant that reaches [`MAX_REQUEST_N`] makes the
//! counter unbounded for the rest of the stream.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::Notify;

use crate::protocol::MAX_REQUEST_N;

/// Saturating credit counter for the receive direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    remaining: u32,
    unbounded: bool,
}

impl Credit {
    pub fn new(initial: u32) -> Self {
        let mut credit = Self {
            remaining: 0,
            unbounded: false,
        };
        credit.grant(initial);
        credit
    }

    /// Add `n` credits.
    pub fn grant(&mut self, n: u32) {
        if self.unbounded {
            return;
        }
        self.remaining = self.remaining.saturating_add(n);
        if self.remaining >= MAX_REQUEST_N {
            self.remaining = MAX_REQUEST_N;
            self.unbounded = true;
        }
    }

    /// Take one credit. `false` when none is left.
    pub fn consume(&mut self) -> bool {
        if self.unbounded {
            return true;
        }
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn available(&self) -> u32 {
        self.remaining
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.unbounded
    }
}

/// Outbound credit shared between the reader and a producer task.
#[derive(Debug)]
pub struct CreditGate {
    remaining: AtomicU32,
    unbounded: AtomicBool,
    notify: Notify,
}

impl CreditGate {
    pub fn new(initial: u32) -> Self {
        let gate = Self {
            remaining: AtomicU32::new(0),
            unbounded: AtomicBool::new(false),
            notify: Notify::new(),
        };
        gate.grant(initial);
        gate
    }

    /// Add `n` credits and wake a suspended producer.
    pub fn grant(&self, n: u32) {
        if n == 0 || self.unbounded.load(Ordering::Acquire) {
            return;
        }
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(n).min(MAX_REQUEST_N))
            })
            .unwrap_or(MAX_REQUEST_N);
        if previous.saturating_add(n) >= MAX_REQUEST_N {
            self.unbounded.store(true, Ordering::Release);
        }
        self.notify.notify_waiters();
    }

    /// Take one credit without waiting.
    pub fn consume(&self) -> bool {
        if self.unbounded.load(Ordering::Acquire) {
            return true;
        }
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    /// Take one credit, suspending until a grant arrives.
    ///
    /// Cancel-safe: dropping the future consumes nothing.
    pub async fn acquire(&self) {
        loop {
            // registered before the check so a grant in between is not lost
            let notified = self.notify.notified();
            if self.consume() {
                return;
            }
            notified.await;
        }
    }

    #[inline]
    pub fn available(&self) -> u32 {
        if self.is_unbounded() {
            return MAX_REQUEST_N;
        }
        self.remaining.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.unbounded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_credit_consume_until_empty() {
        let mut credit = Credit::new(2);
        assert!(credit.consume());
        assert!(credit.consume());
        assert!(!credit.consume());
        assert_eq!(credit.available(), 0);

        credit.grant(1);
        assert!(credit.consume());
    }

    #[test]
    fn test_credit_saturates_to_unbounded() {
        let mut credit = Credit::new(MAX_REQUEST_N - 1);
        assert!(!credit.is_unbounded());
        credit.grant(5);
        assert!(credit.is_unbounded());

        for _ in 0..1000 {
            assert!(credit.consume());
        }
        assert_eq!(credit.available(), MAX_REQUEST_N);
    }

    #[test]
    fn test_credit_zero() {
        let mut credit = Credit::new(0);
        assert!(!credit.consume());
    }

    #[test]
    fn test_gate_consume() {
        let gate = CreditGate::new(1);
        assert!(gate.consume());
        assert!(!gate.consume());
        gate.grant(3);
        assert_eq!(gate.available(), 3);
    }

    #[test]
    fn test_gate_unbounded() {
        let gate = CreditGate::new(MAX_REQUEST_N);
        assert!(gate.is_unbounded());
        for _ in 0..100 {
            assert!(gate.consume());
        }
    }

    #[tokio::test]
    async fn test_acquire_waits_for_grant() {
        let gate = Arc::new(CreditGate::new(0));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.grant(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should resume after grant")
            .unwrap();
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn test_acquire_immediate_with_credit() {
        let gate = CreditGate::new(2);
        gate.acquire().await;
        gate.acquire().await;
        assert!(!gate.consume());
    }
}
