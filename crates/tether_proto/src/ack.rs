//! Acknowledgement tracking: the wire-level ack section and the
//! received-datagram window used for duplicate suppression.

use {
    crate::seq::PacketSeq,
    core::{convert::Infallible, fmt},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Number of datagram sequences remembered by a [`RecvWindow`].
pub const RECV_WINDOW: u16 = 128;

/// Ack section attached to a datagram.
///
/// Stores two pieces of info:
/// * the last received datagram sequence (`last_recv`)
/// * a bitfield of which sequences at and before `last_recv` have been
///   received (`bits`)
///
/// If bit `i` is set in `bits`, then the datagram with sequence
/// `last_recv - i` has been received. For example,
///
/// ```text
/// last_recv: 40
///      bits: 0b0000..00001001
///                    ^   ^  ^
///                    |   |  +- seq 40 (40 - 0) has been received
///                    |   +---- seq 37 (40 - 3) has been received
///                    +-------- seq 33 (40 - 7) has NOT been received
/// ```
///
/// The section is anchored to the *newest* received sequence rather than a
/// contiguous low-water mark: retransmitted messages ride in fresh datagrams
/// with fresh sequences, so a hole in the sequence space is never filled,
/// and a low-water anchor would stall there forever. Anchored to the newest
/// sequence, every recent datagram is reported up to 32 times, giving a lot
/// of redundancy for acks.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Acknowledge {
    /// Last received datagram sequence.
    pub last_recv: PacketSeq,
    /// Bitfield of which sequences at and before `last_recv` have been
    /// received.
    pub bits: u32,
}

impl Acknowledge {
    /// Marks a datagram sequence as received.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::{ack::Acknowledge, seq::PacketSeq};
    /// let mut acks = Acknowledge::default();
    ///
    /// acks.ack(PacketSeq::new(0));
    /// assert!(acks.is_acked(PacketSeq::new(0)));
    /// assert!(!acks.is_acked(PacketSeq::new(1)));
    ///
    /// acks.ack(PacketSeq::new(2));
    /// assert!(acks.is_acked(PacketSeq::new(0)));
    /// assert!(!acks.is_acked(PacketSeq::new(1)));
    /// assert!(acks.is_acked(PacketSeq::new(2)));
    ///
    /// // acknowledgement is an idempotent operation
    /// let acks_clone = acks.clone();
    /// acks.ack(PacketSeq::new(2));
    /// assert_eq!(acks, acks_clone);
    /// ```
    pub fn ack(&mut self, seq: PacketSeq) {
        let dist = seq.dist_to(self.last_recv);
        if let Ok(dist) = u32::try_from(dist) {
            // `seq` is at or before `last_recv`; only set a bit
            self.bits |= shl(1, dist);
        } else {
            // `seq` is after `last_recv`; make it the new anchor
            let shift_by = u32::from(dist.unsigned_abs());
            self.last_recv = seq;
            self.bits = shl(self.bits, shift_by);
            self.bits |= 1;
        }
    }

    /// Gets whether the given sequence has been marked as received.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::{ack::Acknowledge, seq::PacketSeq};
    /// let mut acks = Acknowledge::default();
    ///
    /// acks.ack(PacketSeq::new(1));
    /// assert!(acks.is_acked(PacketSeq::new(1)));
    ///
    /// acks.ack(PacketSeq::new(50));
    /// assert!(acks.is_acked(PacketSeq::new(50)));
    /// assert!(!acks.is_acked(PacketSeq::new(10)));
    /// ```
    #[must_use]
    pub fn is_acked(&self, seq: PacketSeq) -> bool {
        match u32::try_from(seq.dist_to(self.last_recv)) {
            // `seq` is at or before `last_recv`; check the bitfield
            Ok(dist) => self.bits & shl(1, dist) != 0,
            // `seq` is after `last_recv`; it can't have been set
            Err(_) => false,
        }
    }

    /// Converts this into an iterator over all sequences this section
    /// acknowledges.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::{ack::Acknowledge, seq::PacketSeq};
    /// let acks = Acknowledge {
    ///     last_recv: PacketSeq::new(50),
    ///     bits: 0b0010010,
    /// };
    /// let mut iter = acks.seqs();
    /// assert_eq!(PacketSeq::new(49), iter.next().unwrap());
    /// assert_eq!(PacketSeq::new(46), iter.next().unwrap());
    /// assert_eq!(None, iter.next());
    /// ```
    pub fn seqs(self) -> impl Iterator<Item = PacketSeq> {
        // don't ack `last_recv` itself unless bit 0 is set; the anchor may
        // have shifted without that sequence ever arriving
        (0..u32::BITS).filter_map(move |bit_index| {
            if self.bits & shl(1, bit_index) == 0 {
                None
            } else {
                Some(self.last_recv - PacketSeq::new(bit_index as u16))
            }
        })
    }
}

fn shl(n: u32, by: u32) -> u32 {
    // if `by >= 32` all bits are shifted out, and the result is just 0
    n.checked_shl(by).unwrap_or_default()
}

impl fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Acknowledge")
            .field("last_recv", &self.last_recv)
            .field("bits", &format!("{:032b}", self.bits))
            .finish()
    }
}

impl FixedEncodeLen for Acknowledge {
    const ENCODE_LEN: usize = PacketSeq::ENCODE_LEN + u32::ENCODE_LEN;
}

impl Encode for Acknowledge {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.last_recv)?;
        dst.write(&self.bits)?;
        Ok(())
    }
}

impl Decode for Acknowledge {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            last_recv: src.read()?,
            bits: src.read()?,
        })
    }
}

/// Receiver-side record of the last [`RECV_WINDOW`] received datagram
/// sequences, relative to the highest received, used for duplicate
/// suppression.
#[derive(Debug, Clone, Default)]
pub struct RecvWindow {
    /// Highest received sequence; bit `i` of `bits` records `highest - i`.
    highest: PacketSeq,
    bits: u128,
    any: bool,
}

impl RecvWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the given sequence as received.
    ///
    /// Returns `true` if this sequence is fresh, or `false` if it is a
    /// duplicate - already marked inside the window, or so old that it has
    /// fallen off the back of the window.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::{ack::RecvWindow, seq::PacketSeq};
    /// let mut window = RecvWindow::new();
    /// assert!(window.observe(PacketSeq::new(0)));
    /// assert!(window.observe(PacketSeq::new(1)));
    /// assert!(!window.observe(PacketSeq::new(1)));
    ///
    /// // out-of-order arrival is fine
    /// assert!(window.observe(PacketSeq::new(5)));
    /// assert!(window.observe(PacketSeq::new(3)));
    /// assert!(!window.observe(PacketSeq::new(3)));
    /// ```
    pub fn observe(&mut self, seq: PacketSeq) -> bool {
        if !self.any {
            self.any = true;
            self.highest = seq;
            self.bits = 1;
            return true;
        }

        let dist = seq.dist_to(self.highest);
        if dist < 0 {
            // `seq` is ahead of `highest`; shift the window forward
            let shift = u32::from(dist.unsigned_abs());
            self.bits = if shift >= 128 { 0 } else { self.bits << shift };
            self.bits |= 1;
            self.highest = seq;
            true
        } else {
            let dist = u32::from(dist.unsigned_abs());
            if dist >= u32::from(RECV_WINDOW) {
                // too old to tell apart from a replay; drop it
                false
            } else {
                let mask = 1u128 << dist;
                let seen = self.bits & mask != 0;
                self.bits |= mask;
                !seen
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_wraparound() {
        let mut acks = Acknowledge::default();
        acks.ack(PacketSeq::MAX);
        acks.ack(PacketSeq::new(0));
        assert!(acks.is_acked(PacketSeq::MAX));
        assert!(acks.is_acked(PacketSeq::new(0)));
        assert!(!acks.is_acked(PacketSeq::new(1)));
    }

    #[test]
    fn ack_far_jump_drops_old_bits() {
        let mut acks = Acknowledge::default();
        acks.ack(PacketSeq::new(0));
        acks.ack(PacketSeq::new(100));
        assert!(acks.is_acked(PacketSeq::new(100)));
        assert!(!acks.is_acked(PacketSeq::new(0)));
    }

    #[test]
    fn seqs_roundtrip_through_ack() {
        let mut acks = Acknowledge::default();
        for seq in [3u16, 4, 7, 9] {
            acks.ack(PacketSeq::new(seq));
        }
        let mut acked: Vec<u16> = acks.seqs().map(|seq| seq.0).collect();
        acked.sort_unstable();
        assert_eq!(vec![3, 4, 7, 9], acked);
    }

    #[test]
    fn window_duplicates_dropped() {
        let mut window = RecvWindow::new();
        assert!(window.observe(PacketSeq::new(10)));
        assert!(!window.observe(PacketSeq::new(10)));

        // inside the window but never received: fresh
        assert!(window.observe(PacketSeq::new(9)));

        // far behind the window: treated as a replay
        assert!(window.observe(PacketSeq::new(500)));
        assert!(!window.observe(PacketSeq::new(100)));
    }

    #[test]
    fn window_large_jump_resets_bits() {
        let mut window = RecvWindow::new();
        assert!(window.observe(PacketSeq::new(0)));
        assert!(window.observe(PacketSeq::new(300)));
        assert!(!window.observe(PacketSeq::new(300)));
        assert!(window.observe(PacketSeq::new(299)));
    }

    #[test]
    fn window_replays_across_wraparound() {
        let mut window = RecvWindow::new();
        assert!(window.observe(PacketSeq::MAX));
        assert!(window.observe(PacketSeq::new(0)));
        assert!(!window.observe(PacketSeq::MAX));
        assert!(!window.observe(PacketSeq::new(0)));
    }
}
