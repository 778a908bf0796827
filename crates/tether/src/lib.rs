//! Reliable, ordered, prioritized message transport over UDP or TCP.
//!
//! `tether` turns a raw byte-oriented transport into typed, numbered
//! application messages with per-message delivery guarantees:
//!
//! - *reliable* messages are retransmitted until acknowledged and
//!   delivered exactly once
//! - *in-order* messages are delivered in enqueue order within their
//!   content-id chain, independently per chain
//! - messages carry a *priority* (higher sends first) and may carry a
//!   *content id* for sender-side coalescing of superseded state updates
//!
//! A [`NetworkHost`] owns one network worker thread which services every
//! socket through a readiness poll. Applications hold
//! [`MessageConnection`] handles: queue messages with
//! [`MessageConnection::start_new_message`] /
//! [`MessageConnection::end_and_queue`], and pump delivered messages into
//! a [`MessageHandler`] with [`MessageConnection::process`]. The hand-off
//! between application and worker is a pair of wait-free rings per
//! connection ([`WaitFreeRing`]); no locks sit on the message path.
//!
//! The protocol engine itself lives in [`tether_proto`] and is re-exported
//! as [`proto`].

pub mod connection;
pub mod error;
pub mod host;
pub mod message;
pub mod ring;
mod tcp;
mod worker;

pub use tether_proto as proto;
pub use {
    connection::{ConnectionConfig, MessageConnection, QueueFullPolicy},
    error::{ConnectError, ListenError, SendError},
    host::NetworkHost,
    message::{Message, MessageHandler, ServerListener},
    ring::WaitFreeRing,
    tether_proto::{
        conn::{ConnState, ConnStats, DisconnectReason, DropReason},
        sim::SimulatorConfig,
    },
};
