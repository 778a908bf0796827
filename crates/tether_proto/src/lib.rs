//! Sans-IO engine for the `tether` message transport: wire format,
//! acknowledgements, retransmission, congestion control, fragmentation,
//! priority scheduling, and in-order delivery.
//!
//! The centerpiece is [`conn::Conn`], a per-connection state machine that
//! turns a raw unreliable datagram transport into a reliable, in-order,
//! priority-scheduled stream of application messages. It performs no IO of
//! its own: datagrams go in through [`conn::Conn::handle_datagram`], come
//! out of [`conn::Conn::poll_transmit`], and every operation takes the
//! current time explicitly, which makes the whole protocol deterministic
//! and testable without sockets or sleeps.

pub mod ack;
pub mod conn;
pub mod cwnd;
pub mod frag;
pub mod frame;
pub mod packet;
pub mod recv;
pub mod rtt;
pub mod sched;
pub mod seq;
pub mod sim;
