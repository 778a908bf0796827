//! The writable [`Message`] slot and the application-facing callback
//! traits.

use {
    bytes::{Bytes, BytesMut},
    std::{
        sync::{Arc, Mutex},
        time::Instant,
    },
};

use crate::connection::MessageConnection;
pub use tether_proto::conn::DropReason;

/// How many returned payload buffers a connection's pool keeps around for
/// reuse.
const POOL_KEEP: usize = 64;

/// Pool of payload buffers, so steady-state message traffic does not
/// allocate.
///
/// [`Message`]s draw their payload buffer from here and give it back when
/// they are dropped without being queued; buffers of queued messages come
/// back once the frozen payload is no longer referenced anywhere (the next
/// `start_new_message` simply allocates in that case).
#[derive(Debug, Default)]
pub(crate) struct PayloadPool {
    buffers: Mutex<Vec<BytesMut>>,
}

impl PayloadPool {
    pub(crate) fn take(&self, size_hint: usize) -> BytesMut {
        let mut buffers = self.buffers.lock().expect("payload pool poisoned");
        let mut buf = buffers.pop().unwrap_or_default();
        buf.clear();
        buf.reserve(size_hint);
        buf
    }

    pub(crate) fn put_back(&self, buf: BytesMut) {
        let mut buffers = self.buffers.lock().expect("payload pool poisoned");
        if buffers.len() < POOL_KEEP {
            buffers.push(buf);
        }
    }
}

/// A message being composed for sending.
///
/// Obtained from [`MessageConnection::start_new_message`]; filled in with
/// [`Message::write`] and the builder-style setters; handed back to the
/// connection with [`MessageConnection::end_and_queue`]. A message that is
/// dropped instead of queued returns its buffer to the connection's pool.
#[derive(Debug)]
pub struct Message {
    pub(crate) message_id: u32,
    pub(crate) payload: Option<BytesMut>,
    pub(crate) priority: u32,
    pub(crate) reliable: bool,
    pub(crate) in_order: bool,
    pub(crate) content_id: u32,
    pub(crate) send_deadline: Option<Instant>,
    pool: Arc<PayloadPool>,
}

impl Message {
    pub(crate) fn new(message_id: u32, size_hint: usize, pool: Arc<PayloadPool>) -> Self {
        let payload = pool.take(size_hint);
        Self {
            message_id,
            payload: Some(payload),
            priority: 0,
            reliable: true,
            in_order: false,
            content_id: 0,
            send_deadline: None,
            pool,
        }
    }

    /// Appends bytes to the payload.
    pub fn write(&mut self, data: &[u8]) {
        self.payload
            .as_mut()
            .expect("payload is present until the message is queued")
            .extend_from_slice(data);
    }

    /// Sets the send priority; higher is sent first.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether the engine retransmits this message until it is
    /// acknowledged. Defaults to reliable.
    #[must_use]
    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Sets whether delivery waits for all prior in-order messages on the
    /// same content-id chain.
    #[must_use]
    pub fn with_in_order(mut self, in_order: bool) -> Self {
        self.in_order = in_order;
        self
    }

    /// Sets the coalescing/ordering content id; 0 (the default) means no
    /// coalescing.
    #[must_use]
    pub fn with_content_id(mut self, content_id: u32) -> Self {
        self.content_id = content_id;
        self
    }

    /// Sets a deadline after which this message, if still unsent, is
    /// dropped instead.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.send_deadline = Some(deadline);
        self
    }

    /// Gets the application message id this slot was started with.
    #[must_use]
    pub const fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Gets the current payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, BytesMut::len)
    }

    /// Returns `true` if no payload bytes have been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the buffer for queueing.
    pub(crate) fn take_payload(&mut self) -> Bytes {
        self.payload
            .take()
            .expect("payload is present until the message is queued")
            .freeze()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        // only a message that was never queued still owns its buffer
        if let Some(buf) = self.payload.take() {
            self.pool.put_back(buf);
        }
    }
}

/// Receives messages delivered on a connection.
///
/// Handlers run on the application thread, inside
/// [`MessageConnection::process`] - never on the network worker.
pub trait MessageHandler {
    /// Called once per delivered message, in delivery order.
    fn handle_message(
        &mut self,
        conn: &MessageConnection,
        packet_id: u16,
        message_id: u32,
        payload: &[u8],
    );

    /// Called when a queued reliable message was given up on without
    /// being delivered.
    fn handle_dropped(
        &mut self,
        conn: &MessageConnection,
        message_id: u32,
        content_id: u32,
        reason: DropReason,
    ) {
        let _ = (conn, message_id, content_id, reason);
    }

    /// Derives a content id for an *inbound* message, letting the
    /// connection coalesce not-yet-dispatched messages with the same
    /// non-zero id ahead of the handler. Rarely needed; the default
    /// coalesces nothing.
    fn compute_content_id(&mut self, message_id: u32, payload: &[u8]) -> u32 {
        let _ = (message_id, payload);
        0
    }
}

/// Receives connections accepted by a listening [`NetworkHost`].
///
/// The callback runs on the application thread, inside
/// [`NetworkHost::process_events`].
///
/// [`NetworkHost`]: crate::host::NetworkHost
/// [`NetworkHost::process_events`]: crate::host::NetworkHost::process_events
pub trait ServerListener {
    /// Called once per newly established connection, handing it over to
    /// the application.
    fn new_connection_established(&mut self, connection: MessageConnection);
}
