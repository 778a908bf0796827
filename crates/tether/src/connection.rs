//! See [`MessageConnection`].

use {
    crate::{
        error::SendError,
        message::{Message, MessageHandler, PayloadPool},
        ring::WaitFreeRing,
    },
    std::{
        collections::VecDeque,
        fmt,
        net::SocketAddr,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        },
        thread,
        time::Instant,
    },
    tether_proto::{
        conn::{ConnState, ConnStats, DisconnectReason, DropReason},
        recv::InboundMessage,
        sched::OutboundMessage,
        sim::SimulatorConfig,
    },
};

/// What to do when a queued message does not fit in the outbound ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// Stage the message in an app-side overflow queue; effectively an
    /// unbounded producer-side queue. The default.
    #[default]
    Grow,
    /// Report [`SendError::OutboundQueueFull`] and drop the message.
    Drop,
    /// Spin (yielding) until the worker makes room or the connection
    /// closes.
    Block,
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol engine configuration.
    pub proto: tether_proto::conn::Config,
    /// Slot count of the application-to-worker message ring (power of
    /// two; holds one less).
    pub outbound_ring_slots: usize,
    /// Slot count of the worker-to-application message ring.
    pub inbound_ring_slots: usize,
    /// What `end_and_queue` does when the outbound ring is full.
    pub queue_full_policy: QueueFullPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            proto: tether_proto::conn::Config::default(),
            outbound_ring_slots: 256,
            inbound_ring_slots: 1024,
            queue_full_policy: QueueFullPolicy::default(),
        }
    }
}

/// Connection-level notification from the worker to the application.
#[derive(Debug)]
pub(crate) enum Notice {
    State(ConnState, Option<DisconnectReason>),
    Dropped {
        message_id: u32,
        content_id: u32,
        reason: DropReason,
    },
}

const STATE_PENDING: u8 = 0;
const STATE_OK: u8 = 1;
const STATE_DISCONNECTING: u8 = 2;
const STATE_CLOSED: u8 = 3;

fn encode_state(state: ConnState) -> u8 {
    match state {
        ConnState::Pending => STATE_PENDING,
        ConnState::Ok => STATE_OK,
        ConnState::Disconnecting => STATE_DISCONNECTING,
        ConnState::Closed => STATE_CLOSED,
    }
}

fn decode_state(bits: u8) -> ConnState {
    match bits {
        STATE_PENDING => ConnState::Pending,
        STATE_OK => ConnState::Ok,
        STATE_DISCONNECTING => ConnState::Disconnecting,
        _ => ConnState::Closed,
    }
}

/// State shared between an application-side [`MessageConnection`] and the
/// worker-side driver.
///
/// The two message rings are the data plane; everything else is either an
/// atomic snapshot the worker publishes, or a control-plane mailbox that is
/// only touched on reconfiguration.
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) outbound: WaitFreeRing<OutboundMessage>,
    pub(crate) inbound: WaitFreeRing<InboundMessage>,
    pub(crate) notices: WaitFreeRing<Notice>,
    pub(crate) state: AtomicU8,
    pub(crate) close_reason: AtomicU8,
    pub(crate) disconnect_requested: AtomicBool,
    /// Messages inside the worker (scheduler + stamped frames), published
    /// by the worker each drive pass.
    pub(crate) worker_pending: AtomicUsize,
    pub(crate) stats: Mutex<ConnStats>,
    pub(crate) sim_update: Mutex<Option<SimulatorConfig>>,
    pub(crate) waker: Arc<mio::Waker>,
}

impl ConnShared {
    pub(crate) fn new(
        id: u64,
        remote_addr: SocketAddr,
        config: &ConnectionConfig,
        waker: Arc<mio::Waker>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            outbound: WaitFreeRing::new(config.outbound_ring_slots),
            inbound: WaitFreeRing::new(config.inbound_ring_slots),
            notices: WaitFreeRing::new(64),
            state: AtomicU8::new(STATE_PENDING),
            close_reason: AtomicU8::new(0),
            disconnect_requested: AtomicBool::new(false),
            worker_pending: AtomicUsize::new(0),
            stats: Mutex::new(ConnStats::default()),
            sim_update: Mutex::new(None),
            waker,
        }
    }

    pub(crate) fn wake(&self) {
        // a failed wake only costs latency: the worker polls with a
        // bounded timeout anyway
        let _ = self.waker.wake();
    }

    pub(crate) fn publish_state(&self, state: ConnState, reason: Option<DisconnectReason>) {
        self.state.store(encode_state(state), Ordering::Release);
        if let Some(reason) = reason {
            self.close_reason
                .store(encode_reason(reason), Ordering::Release);
        }
    }

    pub(crate) fn load_state(&self) -> ConnState {
        decode_state(self.state.load(Ordering::Acquire))
    }
}

fn encode_reason(reason: DisconnectReason) -> u8 {
    match reason {
        DisconnectReason::PeerUnreachable => 1,
        DisconnectReason::PeerDisconnected => 2,
        DisconnectReason::HandshakeTimeout => 3,
        DisconnectReason::MalformedPackets => 4,
        DisconnectReason::LocalClose => 5,
    }
}

fn decode_reason(bits: u8) -> Option<DisconnectReason> {
    Some(match bits {
        1 => DisconnectReason::PeerUnreachable,
        2 => DisconnectReason::PeerDisconnected,
        3 => DisconnectReason::HandshakeTimeout,
        4 => DisconnectReason::MalformedPackets,
        5 => DisconnectReason::LocalClose,
        _ => return None,
    })
}

/// Application-side handle to one transport connection.
///
/// The handle owns the producer end of the outbound ring and the consumer
/// end of the inbound ring; it is meant to live on one application thread
/// (it is `Send` but deliberately not `Clone`). The network worker never
/// runs application code: delivered messages sit in the inbound ring until
/// [`MessageConnection::process`] pumps them into the registered
/// [`MessageHandler`].
pub struct MessageConnection {
    shared: Arc<ConnShared>,
    pool: Arc<PayloadPool>,
    staging: VecDeque<OutboundMessage>,
    policy: QueueFullPolicy,
    handler: Option<Box<dyn MessageHandler + Send>>,
}

impl MessageConnection {
    pub(crate) fn new(shared: Arc<ConnShared>, policy: QueueFullPolicy) -> Self {
        Self {
            shared,
            pool: Arc::new(PayloadPool::default()),
            staging: VecDeque::new(),
            policy,
            handler: None,
        }
    }

    /// Starts composing a new message with the given application id.
    ///
    /// `size_hint` pre-sizes the payload buffer; it does not limit the
    /// payload.
    ///
    /// # Errors
    ///
    /// Errors if the connection is already closed.
    pub fn start_new_message(
        &self,
        message_id: u32,
        size_hint: usize,
    ) -> Result<Message, SendError> {
        if self.connection_state() == ConnState::Closed {
            return Err(SendError::ConnectionClosed);
        }
        Ok(Message::new(message_id, size_hint, Arc::clone(&self.pool)))
    }

    /// Queues a composed message for sending.
    ///
    /// # Errors
    ///
    /// Errors if the connection no longer accepts messages, or if the
    /// outbound ring is full and the queue-full policy is
    /// [`QueueFullPolicy::Drop`].
    pub fn end_and_queue(&mut self, mut msg: Message) -> Result<(), SendError> {
        match self.connection_state() {
            ConnState::Closed | ConnState::Disconnecting => {
                return Err(SendError::ConnectionClosed);
            }
            ConnState::Pending | ConnState::Ok => {}
        }

        let out = OutboundMessage {
            message_id: msg.message_id,
            payload: msg.take_payload(),
            priority: msg.priority,
            reliable: msg.reliable,
            in_order: msg.in_order,
            content_id: msg.content_id,
            send_deadline: msg.send_deadline,
            created_at: Instant::now(),
        };

        self.flush_staging();
        let out = if self.staging.is_empty() {
            match self.shared.outbound.insert(out) {
                Ok(()) => {
                    self.shared.wake();
                    return Ok(());
                }
                Err(out) => out,
            }
        } else {
            out
        };

        // ring is full (or older messages are already staged)
        match self.policy {
            QueueFullPolicy::Grow => {
                self.staging.push_back(out);
                self.shared.wake();
                Ok(())
            }
            QueueFullPolicy::Drop => Err(SendError::OutboundQueueFull),
            QueueFullPolicy::Block => self.block_push(out),
        }
    }

    fn block_push(&mut self, mut out: OutboundMessage) -> Result<(), SendError> {
        loop {
            if self.connection_state() == ConnState::Closed {
                return Err(SendError::ConnectionClosed);
            }
            match self.shared.outbound.insert(out) {
                Ok(()) => {
                    self.shared.wake();
                    return Ok(());
                }
                Err(back) => {
                    out = back;
                    self.shared.wake();
                    thread::yield_now();
                }
            }
        }
    }

    fn flush_staging(&mut self) {
        while let Some(front) = self.staging.pop_front() {
            if let Err(back) = self.shared.outbound.insert(front) {
                self.staging.push_front(back);
                break;
            }
        }
        if !self.staging.is_empty() {
            self.shared.wake();
        }
    }

    /// Registers the handler that [`MessageConnection::process`] feeds.
    pub fn set_message_handler(&mut self, handler: Box<dyn MessageHandler + Send>) {
        self.handler = Some(handler);
    }

    /// Application-thread pump: drains delivered messages into the
    /// registered handler, surfaces drop notifications, and tops the
    /// outbound ring up from the staging queue.
    ///
    /// Returns the number of messages dispatched to the handler.
    pub fn process(&mut self) -> usize {
        self.flush_staging();

        // the handler is moved out for the duration of the callbacks so
        // it can be handed `&self` without aliasing issues
        let mut handler = self.handler.take();

        while let Some(notice) = self.shared.notices.pop() {
            match notice {
                Notice::State(..) => {
                    // states are read from the atomic snapshot; the notice
                    // exists to guarantee a wake-up is observed
                }
                Notice::Dropped {
                    message_id,
                    content_id,
                    reason,
                } => {
                    if let Some(handler) = handler.as_mut() {
                        handler.handle_dropped(self, message_id, content_id, reason);
                    }
                }
            }
        }

        let mut batch: Vec<Option<InboundMessage>> = Vec::new();
        while let Some(msg) = self.shared.inbound.pop() {
            batch.push(Some(msg));
        }

        // inbound content-id coalescing: an undispatched message is
        // replaced by a newer one with the same derived id
        if let Some(handler) = handler.as_mut() {
            let mut latest: ahash::AHashMap<u32, usize> = ahash::AHashMap::new();
            for index in 0..batch.len() {
                let msg = batch[index].as_ref().expect("not yet coalesced");
                let content_id = handler.compute_content_id(msg.message_id, &msg.payload);
                if content_id == 0 {
                    continue;
                }
                if let Some(previous) = latest.insert(content_id, index) {
                    batch[previous] = None;
                }
            }
        }

        let mut dispatched = 0;
        for msg in batch.into_iter().flatten() {
            dispatched += 1;
            if let Some(handler) = handler.as_mut() {
                handler.handle_message(self, msg.packet_seq, msg.message_id, &msg.payload);
            }
        }

        self.handler = handler;
        dispatched
    }

    /// Initiates a graceful shutdown. Idempotent; completes
    /// asynchronously, with the state reaching [`ConnState::Closed`]
    /// within the disconnect grace period.
    pub fn disconnect(&self) {
        if !self.shared.disconnect_requested.swap(true, Ordering::AcqRel) {
            self.shared.wake();
        }
    }

    /// Gets the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnState {
        self.shared.load_state()
    }

    /// Gets why the connection closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        decode_reason(self.shared.close_reason.load(Ordering::Acquire))
    }

    /// Gets the number of messages queued on this side but not yet put on
    /// the wire.
    #[must_use]
    pub fn num_outbound_messages_pending(&self) -> usize {
        self.staging.len()
            + self.shared.outbound.len()
            + self.shared.worker_pending.load(Ordering::Acquire)
    }

    /// Gets a snapshot of the connection statistics.
    #[must_use]
    pub fn stats(&self) -> ConnStats {
        *self.shared.stats.lock().expect("stats lock poisoned")
    }

    /// Gets the remote endpoint of this connection.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// Reconfigures the send simulator (latency/loss fault injection) for
    /// this connection's transmit path.
    pub fn set_simulator(&self, config: SimulatorConfig) {
        *self
            .shared
            .sim_update
            .lock()
            .expect("simulator lock poisoned") = Some(config);
        self.shared.wake();
    }
}

impl Drop for MessageConnection {
    fn drop(&mut self) {
        // the handle is the only way to reach this connection; initiate a
        // graceful shutdown rather than leaking the worker-side state
        self.disconnect();
    }
}

impl fmt::Display for MessageConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] pending={}",
            self.shared.remote_addr,
            self.connection_state(),
            self.num_outbound_messages_pending(),
        )
    }
}

impl fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageConnection")
            .field("remote_addr", &self.shared.remote_addr)
            .field("state", &self.connection_state())
            .finish()
    }
}
