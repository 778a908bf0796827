//! The message frame: the length-prefixed envelope carrying one application
//! message (or one fragment of one) inside a datagram.
//!
//! On the wire, a frame is:
//!
//! ```text
//! message_id            varint  (< 8 reserved for engine control)
//! reliable_num          varint  (0 = unreliable)
//! chain_id              varint  (0 = not in-order)
//! [chain_seq]           varint  present iff chain_id != 0
//! [frag_total]          varint  0 = unfragmented
//! [frag_index]          varint  present iff frag_total != 0
//! [frag_transfer_id]    varint  present iff frag_total != 0
//! payload_len           varint
//! payload               bytes
//! ```
//!
//! Optional sections follow the same convention as the rest of the header:
//! a zero value means "absent", and the dependent fields are only present
//! when the introducing value is non-zero.

use {
    crate::seq::MessageNum,
    core::fmt,
    octs::{
        BufError, BufTooShortOr, Bytes, Decode, Encode, EncodeLen, Read, VarInt, VarIntTooLarge,
        Write,
    },
    thiserror::Error,
};

/// Ordering stamp of an in-order frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainStamp {
    /// Content-id chain this frame belongs to. Never 0.
    pub chain_id: u32,
    /// 1-based position of this message within its chain.
    pub chain_seq: u32,
}

/// Fragment bookkeeping of a frame that carries one piece of an oversized
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentInfo {
    /// Total number of fragments in the transfer. Never 0.
    pub total: u32,
    /// 0-based index of this fragment.
    pub index: u32,
    /// Per-connection id grouping the fragments of one message.
    pub transfer_id: u16,
}

/// Front-loaded [`Frame`] metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// Application-level type tag. Values below
    /// [`FIRST_USER_MESSAGE_ID`](crate::packet::FIRST_USER_MESSAGE_ID) are
    /// reserved for engine control.
    pub message_id: u32,
    /// Reliable message number, if this frame is reliable.
    pub reliable_num: Option<MessageNum>,
    /// Ordering stamp, if this frame is in-order.
    pub chain: Option<ChainStamp>,
    /// Fragment bookkeeping, if this frame is a fragment.
    pub frag: Option<FragmentInfo>,
}

/// Single frame of a datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame metadata.
    pub header: FrameHeader,
    /// Message (or fragment) payload.
    pub payload: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Attempted to [`Encode`] a [`Frame`] with an invalid header or an
/// over-long payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidFrame {
    /// Payload is longer than a `u32` length prefix can express.
    #[error("payload too large - {len} bytes")]
    PayloadTooLarge {
        /// Length of the payload.
        len: usize,
    },
    /// [`ChainStamp::chain_id`] was 0, which marks an unordered frame on
    /// the wire.
    #[error("chain id must not be 0")]
    ZeroChainId,
    /// [`FragmentInfo::total`] was 0, which marks an unfragmented frame on
    /// the wire.
    #[error("fragment total must not be 0")]
    ZeroFragTotal,
}

impl BufError for InvalidFrame {}

impl EncodeLen for Frame {
    fn encode_len(&self) -> usize {
        let header = &self.header;
        VarInt(header.message_id).encode_len()
            + VarInt(header.reliable_num.map_or(0, |num| num.0)).encode_len()
            + header.chain.map_or(VarInt(0u32).encode_len(), |chain| {
                VarInt(chain.chain_id).encode_len() + VarInt(chain.chain_seq).encode_len()
            })
            + self.header.frag.map_or(VarInt(0u32).encode_len(), |frag| {
                VarInt(frag.total).encode_len()
                    + VarInt(frag.index).encode_len()
                    + VarInt(u32::from(frag.transfer_id)).encode_len()
            })
            + VarInt(self.payload.len() as u32).encode_len()
            + self.payload.len()
    }
}

impl Encode for Frame {
    type Error = InvalidFrame;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let header = &self.header;
        dst.write(VarInt(header.message_id))?;
        dst.write(VarInt(header.reliable_num.map_or(0, |num| num.0)))?;
        match &header.chain {
            None => dst.write(VarInt(0u32))?,
            Some(chain) => {
                if chain.chain_id == 0 {
                    return Err(InvalidFrame::ZeroChainId.into());
                }
                dst.write(VarInt(chain.chain_id))?;
                dst.write(VarInt(chain.chain_seq))?;
            }
        }
        match &header.frag {
            None => dst.write(VarInt(0u32))?,
            Some(frag) => {
                if frag.total == 0 {
                    return Err(InvalidFrame::ZeroFragTotal.into());
                }
                dst.write(VarInt(frag.total))?;
                dst.write(VarInt(frag.index))?;
                dst.write(VarInt(u32::from(frag.transfer_id)))?;
            }
        }
        let len = self.payload.len();
        let len = u32::try_from(len).map_err(|_| InvalidFrame::PayloadTooLarge { len })?;
        dst.write(VarInt(len))?;
        dst.write_from(self.payload.clone())?;
        Ok(())
    }
}

impl Decode for Frame {
    type Error = VarIntTooLarge;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let message_id = src.read::<VarInt<u32>>()?.0;
        let reliable_num = match src.read::<VarInt<u32>>()?.0 {
            0 => None,
            num => Some(MessageNum(num)),
        };
        let chain = match src.read::<VarInt<u32>>()?.0 {
            0 => None,
            chain_id => Some(ChainStamp {
                chain_id,
                chain_seq: src.read::<VarInt<u32>>()?.0,
            }),
        };
        let frag = match src.read::<VarInt<u32>>()?.0 {
            0 => None,
            total => {
                let index = src.read::<VarInt<u32>>()?.0;
                let transfer_id = src.read::<VarInt<u32>>()?.0 as u16;
                Some(FragmentInfo {
                    total,
                    index,
                    transfer_id,
                })
            }
        };
        let len = src.read::<VarInt<u32>>()?.0 as usize;
        let payload = src.read_next(len)?;
        Ok(Self {
            header: FrameHeader {
                message_id,
                reliable_num,
                chain,
                frag,
            },
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) {
        let mut buf = Vec::new();
        buf.write(frame).unwrap();
        assert_eq!(frame.encode_len(), buf.len());
        let mut slice = &buf[..];
        let decoded = slice.read::<Frame>().unwrap();
        assert_eq!(*frame, decoded);
        assert!(slice.is_empty());
    }

    #[test]
    fn plain_unreliable() {
        round_trip(&Frame {
            header: FrameHeader {
                message_id: 10,
                reliable_num: None,
                chain: None,
                frag: None,
            },
            payload: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn reliable_in_order_fragment() {
        round_trip(&Frame {
            header: FrameHeader {
                message_id: 300,
                reliable_num: Some(MessageNum(77)),
                chain: Some(ChainStamp {
                    chain_id: 4,
                    chain_seq: 129,
                }),
                frag: Some(FragmentInfo {
                    total: 30,
                    index: 29,
                    transfer_id: 513,
                }),
            },
            payload: Bytes::from_static(&[0xAB; 200]),
        });
    }

    #[test]
    fn empty_payload() {
        round_trip(&Frame {
            header: FrameHeader {
                message_id: 8,
                reliable_num: Some(MessageNum(1)),
                chain: None,
                frag: None,
            },
            payload: Bytes::new(),
        });
    }

    #[test]
    fn declared_length_past_end_is_malformed() {
        let frame = Frame {
            header: FrameHeader {
                message_id: 10,
                reliable_num: None,
                chain: None,
                frag: None,
            },
            payload: Bytes::from_static(b"hello world"),
        };
        let mut buf = Vec::new();
        buf.write(&frame).unwrap();

        // every truncated prefix must fail to decode, never panic
        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            assert!(slice.read::<Frame>().is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn zero_chain_id_rejected_on_encode() {
        let frame = Frame {
            header: FrameHeader {
                message_id: 10,
                reliable_num: None,
                chain: Some(ChainStamp {
                    chain_id: 0,
                    chain_seq: 1,
                }),
                frag: None,
            },
            payload: Bytes::new(),
        };
        let mut buf = Vec::new();
        assert!(buf.write(&frame).is_err());
    }
}
