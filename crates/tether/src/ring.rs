//! See [`WaitFreeRing`].

use core::{
    cell::UnsafeCell,
    fmt,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Fixed-capacity wait-free single-producer single-consumer ring buffer.
///
/// This is the hand-off primitive between an application thread and the
/// network worker: one side inserts, the other pops, and neither ever takes
/// a lock or allocates. The buffer holds `capacity() = C - 1` elements for
/// a backing array of `C` slots (`C` is a power of two); one slot is kept
/// empty to tell a full ring from an empty one.
///
/// `head` is the consumer's read position and `tail` is one past the
/// producer's last write. Each index is written by exactly one side: the
/// producer fills a slot and then *publishes* the new `tail` with a release
/// store, and the consumer reads `tail` with an acquire load before
/// touching the slot (and symmetrically for `head`). That pairing is the
/// entire synchronization story - there is no CAS and no retry loop, so
/// both operations complete in a bounded number of steps.
///
/// # Contract
///
/// Correct for exactly one producer thread and exactly one consumer thread
/// at a time. The type is `Sync` so it can be shared, but the caller is
/// responsible for upholding the single-producer/single-consumer
/// discipline; within this crate, the connection façade is the only
/// producer of the outbound ring and the worker its only consumer, and the
/// reverse for the inbound ring.
pub struct WaitFreeRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// `slots.len() - 1`; slot count is a power of two, so this doubles as
    /// the index mask.
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for WaitFreeRing<T> {}
unsafe impl<T: Send> Sync for WaitFreeRing<T> {}

impl<T> WaitFreeRing<T> {
    /// Creates a ring with `slot_count` slots, holding up to
    /// `slot_count - 1` elements.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is not a power of two, or is less than 2.
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count.is_power_of_two());
        assert!(slot_count >= 2);
        Self {
            slots: (0..slot_count)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            mask: slot_count - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Gets the number of elements this ring can hold, which is one less
    /// than its slot count.
    ///
    /// [`WaitFreeRing::len`] can legitimately equal this value.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mask
    }

    /// Gets the number of elements currently in the ring.
    ///
    /// Exact from either the producer's or the consumer's thread; from
    /// anywhere else it is a momentary snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// Returns `true` if the ring holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts an element at the tail. Producer side only.
    ///
    /// On a full ring, the element is handed back in `Err` and nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Errors if the ring is full.
    pub fn insert(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = tail.wrapping_add(1) & self.mask;
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        // the slot at `tail` is outside the live region, and only this
        // (single) producer writes slots; any previous value here was
        // moved out by the consumer
        unsafe {
            (*self.slots[tail].get()).write(value);
        }
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Takes the element at the head. Consumer side only.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // the acquire load of `tail` ordered this slot's contents before
        // us; moving the value out leaves the slot logically uninitialized
        let value = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1) & self.mask, Ordering::Release);
        Some(value)
    }

    /// Doubles the slot count, preserving the queued elements in order.
    ///
    /// Not concurrency-safe: `&mut self` means the caller has (and must
    /// have) exclusive access, with both producer and consumer externally
    /// serialized.
    pub fn resize_double(&mut self) {
        let old_count = self.mask + 1;
        let new_count = old_count * 2;
        let mut slots: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..new_count)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        let mut len = 0;
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut at = head;
        while at != tail {
            let value = unsafe { (*self.slots[at].get()).assume_init_read() };
            *slots[len].get_mut() = MaybeUninit::new(value);
            len += 1;
            at = at.wrapping_add(1) & self.mask;
        }

        self.slots = slots;
        self.mask = new_count - 1;
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = len;
    }
}

impl<T> Drop for WaitFreeRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut at = head;
        while at != tail {
            unsafe {
                (*self.slots[at].get()).assume_init_drop();
            }
            at = at.wrapping_add(1) & self.mask;
        }
    }
}

impl<T> fmt::Debug for WaitFreeRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitFreeRing")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, std::thread};

    #[test]
    #[should_panic = "is_power_of_two"]
    fn non_power_of_two_rejected() {
        let _ = WaitFreeRing::<u32>::new(12);
    }

    #[test]
    fn insert_until_full() {
        let ring = WaitFreeRing::new(8);
        assert_eq!(7, ring.capacity());
        for i in 0..7 {
            assert!(ring.insert(i).is_ok());
        }
        // len may legitimately equal capacity
        assert_eq!(7, ring.len());
        assert_eq!(Err(7), ring.insert(7));
    }

    #[test]
    fn fifo_order() {
        let ring = WaitFreeRing::new(8);
        for i in 0..5 {
            ring.insert(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(Some(i), ring.pop());
        }
        assert_eq!(None, ring.pop());
    }

    #[test]
    fn wraparound() {
        let ring = WaitFreeRing::new(4);
        for round in 0..100u32 {
            ring.insert(round).unwrap();
            ring.insert(round + 1000).unwrap();
            assert_eq!(Some(round), ring.pop());
            assert_eq!(Some(round + 1000), ring.pop());
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn resize_preserves_order() {
        let mut ring = WaitFreeRing::new(4);
        ring.insert(0).unwrap();
        ring.insert(1).unwrap();
        // move head off zero so the live region wraps
        assert_eq!(Some(0), ring.pop());
        ring.insert(2).unwrap();
        ring.insert(3).unwrap();
        assert_eq!(Err(4), ring.insert(4));

        ring.resize_double();
        assert_eq!(7, ring.capacity());
        assert_eq!(3, ring.len());
        ring.insert(4).unwrap();
        for i in 1..=4 {
            assert_eq!(Some(i), ring.pop());
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn queued_elements_dropped_with_ring() {
        let value = Arc::new(());
        let ring = WaitFreeRing::new(8);
        for _ in 0..5 {
            ring.insert(Arc::clone(&value)).unwrap();
        }
        assert_eq!(6, Arc::strong_count(&value));
        drop(ring);
        assert_eq!(1, Arc::strong_count(&value));
    }

    /// One producer inserts a million sequential values while one consumer
    /// pops concurrently; the consumer must observe the exact sequence, no
    /// gaps, no duplicates.
    #[test]
    fn spsc_sequence_exact() {
        const COUNT: u32 = 1_000_000;
        let ring = Arc::new(WaitFreeRing::new(1024));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..COUNT {
                    let mut value = i;
                    loop {
                        match ring.insert(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < COUNT {
            match ring.pop() {
                Some(value) => {
                    assert_eq!(expected, value);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }
}
