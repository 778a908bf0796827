//! See [`Scheduler`].

use {
    ahash::AHashMap,
    bytes::Bytes,
    std::{cmp::Ordering, collections::BinaryHeap, time::Instant},
};

/// An application message queued for sending, before the engine has stamped
/// it with wire-level numbers.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Application-level type tag.
    pub message_id: u32,
    /// Message payload.
    pub payload: Bytes,
    /// Send priority; higher is sent first.
    pub priority: u32,
    /// Whether the engine retransmits this message until acknowledged.
    pub reliable: bool,
    /// Whether delivery is delayed until all prior in-order messages on the
    /// same content-id chain have been delivered.
    pub in_order: bool,
    /// Coalescing and ordering key; 0 means no coalescing.
    pub content_id: u32,
    /// If set, the message is dropped rather than sent once this time has
    /// passed.
    pub send_deadline: Option<Instant>,
    /// When the application queued this message.
    pub created_at: Instant,
}

/// Outcome of [`Scheduler::pop`].
#[derive(Debug)]
pub enum Popped {
    /// Message is ready to be stamped and framed.
    Ready(OutboundMessage),
    /// Message sat in the queue past its send deadline and must not be
    /// sent. Reliable expirations are reported to the application.
    Expired(OutboundMessage),
}

#[derive(Debug)]
struct HeapEntry {
    priority: u32,
    created_at: Instant,
    slot: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: highest priority wins; at equal priority the oldest
        // message wins, with the queueing order as the final tie-break
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-connection priority queue of pending application messages, with
/// content-id coalescing and chain-sequence assignment.
///
/// Messages are ordered by `(priority desc, creation_time asc)`. When a
/// message with a non-zero content id is queued while an earlier message
/// with the same content id is still waiting, the earlier one is replaced -
/// only the newest payload for a given content id ever reaches the wire.
/// This gives natural frame-rate coalescing for state updates.
///
/// The scheduler also owns the per-chain "last sent in-order sequence"
/// counters: [`Scheduler::next_chain_seq`] stamps in-order messages at
/// selection time, so a coalesced replacement can never burn a sequence.
#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<HeapEntry>,
    slots: AHashMap<u64, OutboundMessage>,
    next_slot: u64,
    /// Maps a content id to the slot currently representing it. Entries are
    /// removed when the slot is popped, so replacement can only hit
    /// messages that have not been handed to the engine yet.
    by_content_id: AHashMap<u32, u64>,
    chain_seqs: AHashMap<u32, u32>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of messages waiting to be selected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no messages are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Queues a message, coalescing it into an existing queued message with
    /// the same non-zero content id if one is still waiting.
    pub fn push(&mut self, msg: OutboundMessage) {
        if msg.content_id != 0 {
            if let Some(slot) = self.by_content_id.get(&msg.content_id) {
                // replace in place: the old payload is never sent, and the
                // stale heap entry is skipped on pop
                self.slots.remove(slot);
            }
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        if msg.content_id != 0 {
            self.by_content_id.insert(msg.content_id, slot);
        }
        self.heap.push(HeapEntry {
            priority: msg.priority,
            created_at: msg.created_at,
            slot,
        });
        self.slots.insert(slot, msg);
    }

    /// Takes the highest-priority queued message.
    ///
    /// Messages whose send deadline has passed come out as
    /// [`Popped::Expired`] and must not be sent.
    pub fn pop(&mut self, now: Instant) -> Option<Popped> {
        loop {
            let entry = self.heap.pop()?;
            // stale entries point at slots replaced by coalescing
            let Some(msg) = self.slots.remove(&entry.slot) else {
                continue;
            };
            if msg.content_id != 0 {
                if let Some(current) = self.by_content_id.get(&msg.content_id) {
                    if *current == entry.slot {
                        self.by_content_id.remove(&msg.content_id);
                    }
                }
            }
            let expired = msg.send_deadline.is_some_and(|deadline| now >= deadline);
            return Some(if expired {
                Popped::Expired(msg)
            } else {
                Popped::Ready(msg)
            });
        }
    }

    /// Gets the next in-order sequence for the given chain, starting at 1.
    pub fn next_chain_seq(&mut self, chain_id: u32) -> u32 {
        let seq = self.chain_seqs.entry(chain_id).or_insert(0);
        *seq += 1;
        *seq
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn msg(message_id: u32, priority: u32, content_id: u32, created_at: Instant) -> OutboundMessage {
        OutboundMessage {
            message_id,
            payload: Bytes::new(),
            priority,
            reliable: true,
            in_order: false,
            content_id,
            send_deadline: None,
            created_at,
        }
    }

    fn pop_id(sched: &mut Scheduler, now: Instant) -> u32 {
        match sched.pop(now).unwrap() {
            Popped::Ready(msg) => msg.message_id,
            Popped::Expired(msg) => panic!("message {} expired", msg.message_id),
        }
    }

    #[test]
    fn highest_priority_first() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.push(msg(10, 1, 0, now));
        sched.push(msg(11, 5, 0, now));
        sched.push(msg(12, 3, 0, now));

        assert_eq!(11, pop_id(&mut sched, now));
        assert_eq!(12, pop_id(&mut sched, now));
        assert_eq!(10, pop_id(&mut sched, now));
        assert!(sched.pop(now).is_none());
    }

    #[test]
    fn equal_priority_oldest_first() {
        let now = Instant::now();
        let later = now + std::time::Duration::from_millis(5);
        let mut sched = Scheduler::new();
        sched.push(msg(20, 1, 0, later));
        sched.push(msg(21, 1, 0, now));

        assert_eq!(21, pop_id(&mut sched, now));
        assert_eq!(20, pop_id(&mut sched, now));
    }

    #[test]
    fn same_everything_keeps_queue_order() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        for id in 30..40 {
            sched.push(msg(id, 1, 0, now));
        }
        for id in 30..40 {
            assert_eq!(id, pop_id(&mut sched, now));
        }
    }

    #[test]
    fn coalescing_replaces_unsent_message() {
        let now = Instant::now();
        let mut sched = Scheduler::new();

        let mut old = msg(10, 1, 7, now);
        old.payload = Bytes::from_static(b"old");
        let mut new = msg(10, 1, 7, now);
        new.payload = Bytes::from_static(b"new");

        sched.push(old);
        sched.push(new);
        assert_eq!(1, sched.len());

        let popped = sched.pop(now).unwrap();
        assert_matches!(popped, Popped::Ready(msg) if msg.payload == Bytes::from_static(b"new"));
        assert!(sched.pop(now).is_none());
    }

    #[test]
    fn coalescing_does_not_touch_popped_messages() {
        let now = Instant::now();
        let mut sched = Scheduler::new();

        sched.push(msg(10, 1, 7, now));
        assert_eq!(10, pop_id(&mut sched, now));

        // first message was already handed to the engine; this is a fresh
        // queue entry, not a replacement
        sched.push(msg(11, 1, 7, now));
        assert_eq!(11, pop_id(&mut sched, now));
    }

    #[test]
    fn distinct_content_ids_do_not_coalesce() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.push(msg(10, 1, 7, now));
        sched.push(msg(11, 1, 8, now));
        assert_eq!(2, sched.len());
    }

    #[test]
    fn zero_content_id_never_coalesces() {
        let now = Instant::now();
        let mut sched = Scheduler::new();
        sched.push(msg(10, 1, 0, now));
        sched.push(msg(11, 1, 0, now));
        assert_eq!(2, sched.len());
    }

    #[test]
    fn expired_messages_reported_not_sent() {
        let now = Instant::now();
        let deadline = now + std::time::Duration::from_millis(10);
        let mut sched = Scheduler::new();

        let mut stale = msg(10, 5, 0, now);
        stale.send_deadline = Some(deadline);
        sched.push(stale);
        sched.push(msg(11, 1, 0, now));

        let late = deadline + std::time::Duration::from_millis(1);
        assert_matches!(sched.pop(late), Some(Popped::Expired(msg)) if msg.message_id == 10);
        assert_matches!(sched.pop(late), Some(Popped::Ready(msg)) if msg.message_id == 11);
    }

    #[test]
    fn chain_seqs_are_independent_and_start_at_one() {
        let mut sched = Scheduler::new();
        assert_eq!(1, sched.next_chain_seq(1));
        assert_eq!(2, sched.next_chain_seq(1));
        assert_eq!(1, sched.next_chain_seq(2));
        assert_eq!(3, sched.next_chain_seq(1));
    }
}
