//! Defines the structure of datagrams on the wire.
//!
//! This module only contains the type definitions themselves, to make it
//! easy to understand the whole protocol at a glance. The logic that drives
//! them lives in the other modules.
//!
//! The layout of a single datagram is:
//!
//! ```rust,ignore
//! struct Datagram {
//!     header: DatagramHeader, // 2 bytes + optional 6-byte ack section
//!     frames: [Frame],        // see `frame`
//! }
//! ```
//!
//! The header packs a 14-bit sequence number and two flag bits into one
//! little-endian `u16`:
//!
//! ```text
//! bit 15..2   datagram sequence number
//! bit 1       ack section present
//! bit 0       reliable frames present
//! ```
//!
//! Frames follow each other until the end of the datagram; a frame that
//! declares more payload than remains is malformed and the whole datagram is
//! dropped.

use {
    crate::{ack::Acknowledge, seq::PacketSeq},
    core::convert::Infallible,
    octs::{
        BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLen, FixedEncodeLenHint, Read, Write,
    },
};

/// Bit set in the packed header word when an ack section follows.
const FLAG_ACK: u16 = 1 << 1;
/// Bit set in the packed header word when the datagram carries at least one
/// reliable frame.
const FLAG_RELIABLE: u16 = 1 << 0;

/// Metadata at the start of every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Monotonically increasing sequence number of this datagram.
    pub seq: PacketSeq,
    /// Informs the receiver which datagrams we have already received.
    pub acks: Option<Acknowledge>,
    /// Whether any frame in this datagram carries a reliable message.
    ///
    /// The receiver uses this to decide whether the datagram demands an
    /// acknowledgement of its own - ack-only and purely unreliable
    /// datagrams don't, which keeps two idle peers from acking each
    /// other's acks forever.
    pub reliable: bool,
}

impl FixedEncodeLenHint for DatagramHeader {
    const MIN_ENCODE_LEN: usize = u16::ENCODE_LEN;
    const MAX_ENCODE_LEN: usize = u16::ENCODE_LEN + Acknowledge::ENCODE_LEN;
}

impl EncodeLen for DatagramHeader {
    fn encode_len(&self) -> usize {
        u16::ENCODE_LEN + self.acks.map_or(0, |_| Acknowledge::ENCODE_LEN)
    }
}

impl Encode for DatagramHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        let mut word = self.seq.0 << 2;
        if self.acks.is_some() {
            word |= FLAG_ACK;
        }
        if self.reliable {
            word |= FLAG_RELIABLE;
        }
        dst.write(&word)?;
        if let Some(acks) = &self.acks {
            dst.write(acks)?;
        }
        Ok(())
    }
}

impl Decode for DatagramHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let word = src.read::<u16>()?;
        let acks = if word & FLAG_ACK == 0 {
            None
        } else {
            Some(src.read::<Acknowledge>()?)
        };
        Ok(Self {
            seq: PacketSeq::new(word >> 2),
            acks,
            reliable: word & FLAG_RELIABLE != 0,
        })
    }
}

/// Message ids below this value are reserved for engine control frames.
pub const FIRST_USER_MESSAGE_ID: u32 = 8;

/// Engine control frame, carried in a [`Frame`] with a reserved message id.
///
/// [`Frame`]: crate::frame::Frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Client requests a connection, carrying a random challenge.
    Connect {
        /// Protocol version spoken by the client.
        version: u8,
        /// Random value the server must echo back.
        challenge: u32,
    },
    /// Handshake response: echoes the peer's challenge and, server to
    /// client, carries the server's own challenge.
    ///
    /// The server sends this in response to [`Control::Connect`]; the client
    /// completes the handshake by sending one back reliably, echoing the
    /// server challenge.
    ConnectAck {
        /// The peer's challenge, echoed.
        echo: u32,
        /// Our own challenge for the peer to echo.
        challenge: u32,
        /// Protocol version chosen for the connection.
        version: u8,
    },
    /// Sender is shutting the connection down.
    Disconnect,
    /// Acknowledges a [`Control::Disconnect`].
    DisconnectAck,
    /// Keepalive probe.
    Ping {
        /// Opaque value echoed in the matching [`Control::Pong`].
        nonce: u32,
    },
    /// Keepalive response.
    Pong {
        /// Nonce copied from the matching [`Control::Ping`].
        nonce: u32,
    },
    /// Advertises a cap on how fast the peer may send to us.
    FlowControl {
        /// Maximum send rate in datagrams per second; 0 lifts the cap.
        max_send_rate: u32,
    },
}

impl Control {
    /// Gets the reserved message id this control frame is carried under.
    #[must_use]
    pub const fn message_id(&self) -> u32 {
        match self {
            Self::Connect { .. } => 1,
            Self::ConnectAck { .. } => 2,
            Self::Disconnect => 3,
            Self::DisconnectAck => 4,
            Self::Ping { .. } => 5,
            Self::Pong { .. } => 6,
            Self::FlowControl { .. } => 7,
        }
    }

    /// Serializes this control frame's payload.
    #[must_use]
    pub fn to_payload(&self) -> bytes::Bytes {
        let mut buf = Vec::new();
        self.encode_payload(&mut buf)
            .expect("should grow the buffer when writing over capacity");
        bytes::Bytes::from(buf)
    }

    fn encode_payload(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        match self {
            Self::Connect { version, challenge } => {
                dst.write(challenge)?;
                dst.write(version)?;
            }
            Self::ConnectAck {
                echo,
                challenge,
                version,
            } => {
                dst.write(echo)?;
                dst.write(challenge)?;
                dst.write(version)?;
            }
            Self::Disconnect | Self::DisconnectAck => {}
            Self::Ping { nonce } | Self::Pong { nonce } => {
                dst.write(nonce)?;
            }
            Self::FlowControl { max_send_rate } => {
                dst.write(max_send_rate)?;
            }
        }
        Ok(())
    }

    /// Parses a control frame from a reserved message id and its payload.
    ///
    /// Returns [`None`] if the id is not a known control id or the payload
    /// does not fit the id.
    #[must_use]
    pub fn from_payload(message_id: u32, mut payload: &[u8]) -> Option<Self> {
        let control = match message_id {
            1 => Self::Connect {
                challenge: payload.read().ok()?,
                version: payload.read().ok()?,
            },
            2 => Self::ConnectAck {
                echo: payload.read().ok()?,
                challenge: payload.read().ok()?,
                version: payload.read().ok()?,
            },
            3 => Self::Disconnect,
            4 => Self::DisconnectAck,
            5 => Self::Ping {
                nonce: payload.read().ok()?,
            },
            6 => Self::Pong {
                nonce: payload.read().ok()?,
            },
            7 => Self::FlowControl {
                max_send_rate: payload.read().ok()?,
            },
            _ => return None,
        };
        Some(control)
    }
}
