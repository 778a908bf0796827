//! Sequence number types for datagrams and reliable messages.

use {
    core::{
        cmp::Ordering,
        convert::Infallible,
        fmt,
        ops::{Add, AddAssign, Sub, SubAssign},
    },
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, VarInt, Write},
};

/// Number of bits in a [`PacketSeq`].
///
/// The datagram header packs the sequence together with two flag bits into a
/// single `u16`, leaving 14 bits for the sequence itself. The
/// acknowledgement bitfield window (32) plus the received-datagram window
/// (128) must stay below half the sequence space (8192), which they do by a
/// wide margin.
pub const SEQ_BITS: u32 = 14;

/// Bitmask selecting the valid bits of a [`PacketSeq`].
pub const SEQ_MASK: u16 = (1 << SEQ_BITS) - 1;

const SEQ_HALF: u16 = 1 << (SEQ_BITS - 1);

/// Sequence number of a datagram in transit.
///
/// The number is stored in a [`u16`] but only occupies [`SEQ_BITS`] bits, so
/// it wraps around quickly - many datagrams can be sent per second. Users of
/// a sequence number should take this into account, and use the custom
/// [`PacketSeq::cmp`] implementation which takes wraparound into
/// consideration.
///
/// # Wraparound
///
/// The sequence number can be visualized as an infinite number line, where
/// `16383` is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     16382  16383    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](core::ops::Add) and [subtraction](core::ops::Sub) always wrap
/// within the 14-bit space.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketSeq(pub u16);

impl PacketSeq {
    /// Largest representable sequence number.
    pub const MAX: Self = Self(SEQ_MASK);

    /// Creates a new sequence number, masking the value into range.
    #[must_use]
    pub const fn new(n: u16) -> Self {
        Self(n & SEQ_MASK)
    }

    /// Gets a signed number for the value of sequences "elapsed" between
    /// `rhs` and `self`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound
    /// and therefore returning a signed value. This always returns the
    /// smallest path around the sequence circle.
    ///
    /// # Example
    ///
    /// ```
    /// # use tether_proto::seq::PacketSeq;
    /// assert_eq!(PacketSeq::new(0).dist_to(PacketSeq::new(5)), 5);
    /// assert_eq!(PacketSeq::new(3).dist_to(PacketSeq::new(5)), 2);
    /// assert_eq!(PacketSeq::new(1).dist_to(PacketSeq::new(0)), -1);
    ///
    /// assert_eq!(PacketSeq::new(0).dist_to(PacketSeq::MAX), -1);
    /// assert_eq!(PacketSeq::MAX.dist_to(PacketSeq::new(0)), 1);
    /// assert_eq!(PacketSeq::MAX.dist_to(PacketSeq::new(3)), 4);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        let d = rhs.0.wrapping_sub(self.0) & SEQ_MASK;
        if d < SEQ_HALF {
            d as i16
        } else {
            (d as i32 - (1 << SEQ_BITS)) as i16
        }
    }
}

impl fmt::Debug for PacketSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PacketSeq").field(&self.0).finish()
    }
}

impl Ord for PacketSeq {
    /// Logically compares `self` to `other` in a way that respects
    /// wraparound of sequence numbers, treating e.g. `0 cmp 1` as [`Less`]
    /// (as expected), but `0 cmp 16383` as [`Greater`].
    ///
    /// If the two values compared have a real difference equal to or larger
    /// than half the sequence space, no guarantees are upheld.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        0i16.cmp(&self.dist_to(*other))
    }
}

impl PartialOrd for PacketSeq {
    /// See [`PacketSeq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for PacketSeq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0) & SEQ_MASK)
    }
}

impl AddAssign for PacketSeq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for PacketSeq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0) & SEQ_MASK)
    }
}

impl SubAssign for PacketSeq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for PacketSeq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for PacketSeq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for PacketSeq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self::new(src.read()?))
    }
}

/// Per-connection number of a reliable message.
///
/// Every reliable message (and every fragment of a fragmented message) is
/// stamped with the next value of a monotonically increasing 32-bit counter.
/// The receiver uses these numbers for exactly-once delivery. `0` is never a
/// valid reliable message number - on the wire it marks a frame as
/// unreliable.
///
/// Wraparound is handled the same way as for [`PacketSeq`], though with a
/// 32-bit space it takes a very long-lived connection to reach it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageNum(pub u32);

impl MessageNum {
    /// First valid reliable message number.
    pub const FIRST: Self = Self(1);

    /// Gets the signed distance from `self` to `rhs`, respecting wraparound.
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i32 {
        rhs.0.wrapping_sub(self.0) as i32
    }

    /// Gets the next message number, skipping the reserved `0`.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }
}

impl fmt::Debug for MessageNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MessageNum").field(&self.0).finish()
    }
}

impl Ord for MessageNum {
    /// See [`PacketSeq::cmp`].
    fn cmp(&self, other: &Self) -> Ordering {
        0i32.cmp(&self.dist_to(*other))
    }
}

impl PartialOrd for MessageNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl octs::EncodeLen for MessageNum {
    fn encode_len(&self) -> usize {
        VarInt(self.0).encode_len()
    }
}

impl Encode for MessageNum {
    type Error = <VarInt<u32> as Encode>::Error;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(VarInt(self.0))
    }
}

impl Decode for MessageNum {
    type Error = <VarInt<u32> as Decode>::Error;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read::<VarInt<u32>>()?.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_construction() {
        assert_eq!(PacketSeq::new(0), PacketSeq::new(1 << 14));
        assert_eq!(PacketSeq::new(5), PacketSeq::new((1 << 14) + 5));
        assert_eq!(SEQ_MASK, PacketSeq::MAX.0);
    }

    #[test]
    fn increasing_wraparound() {
        assert!(PacketSeq::new(0) < PacketSeq::new(1));
        assert!(PacketSeq::new(1) < PacketSeq::new(2));
        assert!(PacketSeq::MAX - PacketSeq::new(3) < PacketSeq::MAX);
        assert!(PacketSeq::MAX < PacketSeq::new(0));
        assert!(PacketSeq::MAX < PacketSeq::new(1));
        assert!(PacketSeq::MAX - PacketSeq::new(3) < PacketSeq::new(2));

        // we explicitly don't test what happens when the difference is
        // around half the sequence space, because we guarantee no behaviour
        // there - that would mean a datagram arrived after ~8000 others
    }

    #[test]
    fn add_sub_wrap() {
        assert_eq!(PacketSeq::new(0), PacketSeq::MAX + PacketSeq::new(1));
        assert_eq!(PacketSeq::MAX, PacketSeq::new(0) - PacketSeq::new(1));
    }

    #[test]
    fn message_num_skips_zero() {
        assert_eq!(MessageNum(1), MessageNum(u32::MAX).next());
        assert_eq!(MessageNum(2), MessageNum(1).next());
    }

    #[test]
    fn message_num_wraparound_order() {
        assert!(MessageNum(u32::MAX) < MessageNum(1));
        assert!(MessageNum(1) < MessageNum(2));
    }
}
