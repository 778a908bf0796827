//! Inbound message pipeline: exactly-once filtering of reliable messages
//! and per-chain in-order delivery.

use {
    crate::{frame::ChainStamp, seq::MessageNum},
    ahash::{AHashMap, AHashSet},
    bytes::Bytes,
    std::time::{Duration, Instant},
};

/// A message that has passed duplicate suppression and reassembly, on its
/// way to the application handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sequence of the datagram that completed this message.
    pub packet_seq: u16,
    /// Application-level type tag.
    pub message_id: u32,
    /// Message payload.
    pub payload: Bytes,
}

/// Tracks which reliable message numbers have already been delivered, so
/// that a retransmitted copy is never delivered twice.
///
/// `pending` is the lowest number we have not yet seen; everything below it
/// is known-delivered, and numbers above it that arrived out of order sit in
/// `seen` until the gap closes.
#[derive(Debug, Default)]
pub struct DupWindow {
    pending: MessageNum,
    seen: AHashSet<MessageNum>,
}

impl DupWindow {
    /// Creates a window with nothing delivered yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: MessageNum::FIRST,
            seen: AHashSet::new(),
        }
    }

    /// Records a reliable message number, returning `true` the first time
    /// it is seen and `false` for every duplicate.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::{recv::DupWindow, seq::MessageNum};
    /// let mut window = DupWindow::new();
    /// assert!(window.observe(MessageNum(1)));
    /// assert!(!window.observe(MessageNum(1)));
    ///
    /// // out-of-order arrival: 3 before 2
    /// assert!(window.observe(MessageNum(3)));
    /// assert!(window.observe(MessageNum(2)));
    /// assert!(!window.observe(MessageNum(3)));
    /// ```
    pub fn observe(&mut self, num: MessageNum) -> bool {
        if num < self.pending {
            // at or below the low-water mark: guaranteed already delivered
            return false;
        }
        if !self.seen.insert(num) {
            return false;
        }
        // close the gap: e.g. pending 40, seen {40, 41, 45}
        // -> pending 42, seen {45}
        while self.seen.remove(&self.pending) {
            self.pending = self.pending.next();
        }
        true
    }
}

#[derive(Debug)]
struct Chain {
    next_expected: u32,
    waiting: AHashMap<u32, InboundMessage>,
    last_activity: Instant,
}

/// Per-chain in-order waiting room.
///
/// Each non-zero content id forms an independent ordering channel. A frame
/// whose chain sequence equals the chain's `next_expected` is dispatched
/// immediately, and the waiting room drains as far as it can; higher
/// sequences are parked until the gap closes.
///
/// A gap can only close if the missing message is reliable. For an
/// *unreliable* in-order frame ahead of the expected sequence, the chain
/// skips forward instead of parking forever: the frame is delivered, the
/// expectation jumps past it, and anything parked behind it is discarded.
/// Delivery order never goes backwards either way.
#[derive(Debug, Default)]
pub struct ChainRouter {
    chains: AHashMap<u32, Chain>,
}

impl ChainRouter {
    /// Creates a router with no chain state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of chains currently holding state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Returns `true` if no chains hold state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Routes one in-order message, appending everything that becomes
    /// dispatchable to `out` in delivery order.
    pub fn push(
        &mut self,
        now: Instant,
        reliable: bool,
        stamp: ChainStamp,
        msg: InboundMessage,
        out: &mut Vec<InboundMessage>,
    ) {
        let chain = self.chains.entry(stamp.chain_id).or_insert_with(|| Chain {
            next_expected: 1,
            waiting: AHashMap::new(),
            last_activity: now,
        });
        chain.last_activity = now;

        if stamp.chain_seq < chain.next_expected {
            // already delivered (or skipped); delivering it now would go
            // backwards in the chain
            return;
        }

        if stamp.chain_seq == chain.next_expected {
            out.push(msg);
            chain.next_expected += 1;
        } else if reliable {
            // the gap will fill: the missing messages are reliable too,
            // since an unreliable skip would have moved next_expected past
            // this sequence already
            chain.waiting.insert(stamp.chain_seq, msg);
            return;
        } else {
            // unreliable frame ahead of the gap: skip forward
            chain.waiting.retain(|seq, _| *seq > stamp.chain_seq);
            out.push(msg);
            chain.next_expected = stamp.chain_seq + 1;
        }

        // drain the waiting room as far as it goes
        while let Some(msg) = chain.waiting.remove(&chain.next_expected) {
            out.push(msg);
            chain.next_expected += 1;
        }
    }

    /// Drops state for chains that have been idle for at least `grace`,
    /// returning how many were reclaimed.
    pub fn reclaim_idle(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.chains.len();
        self.chains
            .retain(|_, chain| now.duration_since(chain.last_activity) < grace);
        before - self.chains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(message_id: u32) -> InboundMessage {
        InboundMessage {
            packet_seq: 0,
            message_id,
            payload: Bytes::new(),
        }
    }

    fn stamp(chain_id: u32, chain_seq: u32) -> ChainStamp {
        ChainStamp { chain_id, chain_seq }
    }

    #[test]
    fn dup_window_exactly_once_over_many() {
        let mut window = DupWindow::new();
        for num in 1..=1000u32 {
            assert!(window.observe(MessageNum(num)));
        }
        for num in 1..=1000u32 {
            assert!(!window.observe(MessageNum(num)));
        }
        assert!(window.observe(MessageNum(1001)));
    }

    #[test]
    fn dup_window_interleaved_retransmits() {
        let mut window = DupWindow::new();
        assert!(window.observe(MessageNum(1)));
        assert!(window.observe(MessageNum(3)));
        assert!(!window.observe(MessageNum(3)));
        assert!(window.observe(MessageNum(2)));
        assert!(!window.observe(MessageNum(1)));
        assert!(window.observe(MessageNum(4)));
        assert!(!window.observe(MessageNum(2)));
    }

    #[test]
    fn in_order_dispatch() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        router.push(now, true, stamp(1, 2), msg(102), &mut out);
        let ids: Vec<u32> = out.iter().map(|m| m.message_id).collect();
        assert_eq!(vec![101, 102], ids);
    }

    #[test]
    fn out_of_order_parks_until_gap_closes() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        router.push(now, true, stamp(1, 2), msg(102), &mut out);
        router.push(now, true, stamp(1, 3), msg(103), &mut out);
        assert!(out.is_empty());

        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        let ids: Vec<u32> = out.iter().map(|m| m.message_id).collect();
        assert_eq!(vec![101, 102, 103], ids);
    }

    #[test]
    fn chains_are_independent() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        // chain 2 is blocked on its first message; chain 1 flows freely
        router.push(now, true, stamp(2, 2), msg(202), &mut out);
        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        let ids: Vec<u32> = out.iter().map(|m| m.message_id).collect();
        assert_eq!(vec![101], ids);
    }

    #[test]
    fn duplicate_chain_seq_not_redelivered() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        assert_eq!(1, out.len());
    }

    #[test]
    fn unreliable_skips_over_lost_predecessor() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        router.push(now, false, stamp(1, 1), msg(101), &mut out);
        // seq 2 lost forever; 3 must not stall the chain
        router.push(now, false, stamp(1, 3), msg(103), &mut out);
        let ids: Vec<u32> = out.iter().map(|m| m.message_id).collect();
        assert_eq!(vec![101, 103], ids);

        // the lost message arriving late is dropped, not delivered backwards
        router.push(now, false, stamp(1, 2), msg(102), &mut out);
        assert_eq!(2, out.len());
    }

    #[test]
    fn idle_chains_reclaimed() {
        let mut router = ChainRouter::new();
        let now = Instant::now();
        let mut out = Vec::new();

        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        assert_eq!(1, router.len());

        let grace = Duration::from_secs(30);
        assert_eq!(0, router.reclaim_idle(now + Duration::from_secs(29), grace));
        assert_eq!(1, router.reclaim_idle(now + Duration::from_secs(31), grace));
        assert!(router.is_empty());

        // a fresh message on the same chain id starts the chain over
        router.push(now, true, stamp(1, 1), msg(101), &mut out);
        assert_eq!(2, out.len());
    }
}
