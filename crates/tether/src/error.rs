//! Error types surfaced to the application.

use thiserror::Error;

/// Error when queueing a message on a connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is closed; see
    /// [`MessageConnection::close_reason`](crate::connection::MessageConnection::close_reason).
    #[error("connection closed")]
    ConnectionClosed,
    /// The application-to-worker ring is full and the connection's policy
    /// is to report rather than stage or block.
    #[error("outbound queue full")]
    OutboundQueueFull,
    /// The message exceeds what the transport can carry even after
    /// fragmenting.
    #[error("message too large after fragmenting")]
    MessageTooLargeAfterFragment,
}

/// Error when establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The peer actively refused the connection.
    #[error("connection refused")]
    Refused,
    /// The socket could not be created or connected.
    #[error("socket setup failed")]
    Io(#[from] std::io::Error),
    /// The host has already been shut down.
    #[error("host is shut down")]
    HostShutDown,
}

/// Error when setting up a listener.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The listening socket could not be bound.
    #[error("bind failed")]
    Io(#[from] std::io::Error),
    /// The host has already been shut down.
    #[error("host is shut down")]
    HostShutDown,
}
