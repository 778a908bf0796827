//! See [`Conn`].

mod recv;
mod send;

use {
    crate::{
        ack::{Acknowledge, RecvWindow},
        cwnd::CongestionControl,
        frag::{FragmentReceiver, FragmentSender},
        frame::FrameHeader,
        packet::Control,
        recv::{ChainRouter, DupWindow, InboundMessage},
        rtt::RttEstimator,
        sched::{OutboundMessage, Scheduler},
        seq::{MessageNum, PacketSeq},
        sim::{Simulator, SimulatorConfig},
    },
    ahash::AHashMap,
    bytes::Bytes,
    octs::FixedEncodeLenHint,
    std::{
        collections::VecDeque,
        fmt,
        time::{Duration, Instant},
    },
    tracing::{debug, trace},
};

/// Worst-case encoded length of a frame header: eight var-ints of up to
/// five bytes each.
const FRAME_OVERHEAD: usize = 8 * 5;

/// Configuration for a [`Conn`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version advertised during the handshake.
    pub protocol_version: u8,
    /// Maximum bytes of a single datagram, including the engine's own
    /// header. Kept under typical path MTU to avoid IP fragmentation.
    pub max_datagram_payload: usize,
    /// How long received reliable traffic may wait before an ack-only
    /// datagram is emitted for it.
    pub ack_delay: Duration,
    /// How many times a reliable message may be retransmitted before the
    /// peer is declared unreachable.
    pub max_retries: u32,
    /// Initial congestion window, in datagrams.
    pub initial_cwnd: u32,
    /// Slow-start threshold, in datagrams.
    pub slow_start_threshold: u32,
    /// Maximum number of fragments a single message may be split into.
    pub max_fragments: u32,
    /// How long a partially received fragmented message is buffered before
    /// being discarded.
    pub fragment_timeout: Duration,
    /// How long the handshake may take before the connection fails.
    pub handshake_timeout: Duration,
    /// Interval between handshake (and disconnect) control frame resends.
    pub handshake_resend: Duration,
    /// How long a graceful disconnect may spend draining in-flight
    /// reliable messages.
    pub disconnect_grace: Duration,
    /// Idle time after which a ping is sent to keep the connection (and
    /// the RTT estimate) alive.
    pub keepalive_interval: Duration,
    /// Idle time after which a receiver-side in-order chain's state is
    /// reclaimed.
    pub chain_idle_grace: Duration,
    /// Number of malformed packets tolerated within
    /// [`malformed_window`](Config::malformed_window) before the
    /// connection is torn down.
    pub malformed_burst: u32,
    /// Window over which malformed packets are counted.
    pub malformed_window: Duration,
    /// Initial RTT estimate used before the first sample.
    pub initial_rtt: Duration,
    /// Outbound fault injection, for tests.
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_datagram_payload: 1400,
            ack_delay: Duration::from_millis(10),
            max_retries: 60,
            initial_cwnd: 1,
            slow_start_threshold: 64,
            max_fragments: 4096,
            fragment_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            handshake_resend: Duration::from_millis(250),
            disconnect_grace: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            chain_idle_grace: Duration::from_secs(30),
            malformed_burst: 10,
            malformed_window: Duration::from_secs(10),
            initial_rtt: crate::rtt::DEFAULT_INITIAL_RTT,
            simulator: SimulatorConfig::default(),
        }
    }
}

/// State of a [`Conn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake in progress; application traffic is queued but not sent.
    Pending,
    /// Handshake complete; traffic flows.
    Ok,
    /// Shutdown initiated; no new messages are accepted, in-flight
    /// reliable messages are draining.
    Disconnecting,
    /// Connection is finished; see the attached reason.
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a [`Conn`] reached [`ConnState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A reliable message exhausted its retries.
    PeerUnreachable,
    /// The peer performed a clean shutdown.
    PeerDisconnected,
    /// The handshake did not complete in time.
    HandshakeTimeout,
    /// The peer sent malformed traffic at a sustained rate.
    MalformedPackets,
    /// The local side called disconnect.
    LocalClose,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::PeerUnreachable => "peer unreachable",
            Self::PeerDisconnected => "peer disconnected",
            Self::HandshakeTimeout => "handshake timeout",
            Self::MalformedPackets => "sustained malformed traffic",
            Self::LocalClose => "closed locally",
        };
        f.write_str(s)
    }
}

/// Why the engine gave up on a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The send deadline passed before the message was selected.
    DeadlineExpired,
    /// Even after fragmenting, the message exceeds the configured limits.
    TooLarge,
    /// The connection went down with the message still pending.
    ConnectionLost,
}

/// Something the engine wants the application layer to know about.
#[derive(Debug)]
pub enum Event {
    /// Handshake completed; the connection is live.
    Connected,
    /// A message from the peer is ready for the handler.
    Delivered(InboundMessage),
    /// A queued reliable message was given up on without being delivered.
    Dropped {
        /// Application message id of the dropped message.
        message_id: u32,
        /// Content id of the dropped message; 0 if none.
        content_id: u32,
        /// Why it was dropped.
        reason: DropReason,
    },
    /// The connection reached [`ConnState::Closed`].
    Disconnected(DisconnectReason),
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    /// Smoothed round-trip time estimate.
    pub rtt: Duration,
    /// Smoothed round-trip time deviation.
    pub rtt_var: Duration,
    /// Congestion window, in datagrams.
    pub cwnd: usize,
    /// Reliable datagrams currently in flight.
    pub in_flight: usize,
    /// Datagrams put on the wire.
    pub datagrams_sent: u64,
    /// Datagrams taken off the wire.
    pub datagrams_recv: u64,
    /// Application messages handed to the framing layer.
    pub messages_sent: u64,
    /// Application messages delivered up to the handler.
    pub messages_delivered: u64,
    /// Reliable datagrams whose retransmission timer fired.
    pub retransmits: u64,
    /// Queued messages dropped without delivery.
    pub messages_dropped: u64,
    /// Malformed packets observed.
    pub malformed_packets: u64,
}

impl ConnStats {
    /// Estimated fraction of sent datagrams that were lost, from the
    /// retransmission count.
    #[must_use]
    pub fn loss_rate(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.retransmits as f64 / self.datagrams_sent as f64
        }
    }

    /// Current send rate allowance in datagrams per second, from the
    /// congestion window and the RTT estimate.
    #[must_use]
    pub fn send_rate(&self) -> f64 {
        let rtt = self.rtt.as_secs_f64();
        if rtt <= 0.0 {
            0.0
        } else {
            self.cwnd as f64 / rtt
        }
    }
}

/// A frame that has been stamped with its wire-level numbers and is waiting
/// to be packed into a datagram, or to be retransmitted.
#[derive(Debug, Clone)]
pub(crate) struct PendingFrame {
    pub(crate) header: FrameHeader,
    pub(crate) payload: Bytes,
    pub(crate) retries: u32,
}

/// Entry in the sent-not-acked table: the reliable frames one datagram
/// carried, plus its timers.
#[derive(Debug)]
struct SentDatagram {
    frames: Vec<PendingFrame>,
    sent_at: Instant,
    rto_at: Instant,
    /// Whether any carried frame had been sent before. Datagrams carrying
    /// retransmitted frames never produce RTT samples (Karn's rule).
    retransmission: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Per-connection reliable-UDP protocol engine.
///
/// The engine is sans-IO: it consumes raw datagrams via
/// [`Conn::handle_datagram`], produces raw datagrams via
/// [`Conn::poll_transmit`], and is driven by [`Conn::tick`]. Every
/// operation takes `now` explicitly; the engine never reads the clock.
/// Everything it wants the application to know comes out of
/// [`Conn::poll_event`].
#[derive(Debug)]
pub struct Conn {
    config: Config,
    role: Role,
    state: ConnState,
    close_reason: Option<DisconnectReason>,

    // handshake
    created_at: Instant,
    our_challenge: u32,
    peer_challenge: Option<u32>,
    last_handshake_send: Option<Instant>,

    // send
    sched: Scheduler,
    /// Frames stamped and ready to pack, in order.
    ready_frames: VecDeque<PendingFrame>,
    /// Frames re-queued by a retransmission timeout; drained before
    /// `ready_frames`.
    resend_queue: VecDeque<PendingFrame>,
    /// Control frames to send at the next opportunity, outside the
    /// congestion window.
    control_queue: VecDeque<Control>,
    next_reliable_num: MessageNum,
    next_packet_seq: PacketSeq,
    frag_send: FragmentSender,
    sent: AHashMap<u16, SentDatagram>,
    cwnd: CongestionControl,
    rtt: RttEstimator,
    next_send_allowed: Instant,
    peer_rate_cap: Option<u32>,
    /// Datagrams to emit immediately, bypassing the packing path.
    outbox: VecDeque<Bytes>,

    // recv
    recv_window: RecvWindow,
    acks: Acknowledge,
    any_recv: bool,
    ack_pending_since: Option<Instant>,
    dup: DupWindow,
    chains: ChainRouter,
    frag_recv: FragmentReceiver,
    malformed_times: VecDeque<Instant>,

    // liveness
    last_send: Instant,
    last_recv: Instant,
    next_ping_nonce: u32,
    outstanding_ping: Option<(u32, Instant)>,

    // disconnect
    disconnect_started: Option<Instant>,
    disconnect_sent_at: Option<Instant>,

    events: VecDeque<Event>,
    sim: Option<Simulator>,
    stats: ConnStats,
}

impl Conn {
    fn new(config: Config, role: Role, now: Instant, our_challenge: u32) -> Self {
        let max_frag_len = config
            .max_datagram_payload
            .saturating_sub(crate::packet::DatagramHeader::MAX_ENCODE_LEN + FRAME_OVERHEAD)
            .max(1);
        let sim = config
            .simulator
            .enabled
            .then(|| Simulator::new(config.simulator.clone()));
        Self {
            role,
            state: ConnState::Pending,
            close_reason: None,
            created_at: now,
            our_challenge,
            peer_challenge: None,
            last_handshake_send: None,
            sched: Scheduler::new(),
            ready_frames: VecDeque::new(),
            resend_queue: VecDeque::new(),
            control_queue: VecDeque::new(),
            next_reliable_num: MessageNum::FIRST,
            next_packet_seq: PacketSeq::new(0),
            frag_send: FragmentSender::new(max_frag_len, config.max_fragments),
            sent: AHashMap::new(),
            cwnd: CongestionControl::new(config.initial_cwnd, config.slow_start_threshold),
            rtt: RttEstimator::new(config.initial_rtt),
            next_send_allowed: now,
            peer_rate_cap: None,
            outbox: VecDeque::new(),
            recv_window: RecvWindow::new(),
            acks: Acknowledge::default(),
            any_recv: false,
            ack_pending_since: None,
            dup: DupWindow::new(),
            chains: ChainRouter::new(),
            frag_recv: FragmentReceiver::new(config.max_fragments),
            malformed_times: VecDeque::new(),
            last_send: now,
            last_recv: now,
            next_ping_nonce: 0,
            outstanding_ping: None,
            disconnect_started: None,
            disconnect_sent_at: None,
            events: VecDeque::new(),
            sim,
            stats: ConnStats::default(),
            config,
        }
    }

    /// Creates the client side of a connection; it will send `Connect`
    /// frames until the server answers or the handshake times out.
    #[must_use]
    pub fn new_client(config: Config, now: Instant) -> Self {
        Self::new(config, Role::Client, now, rand::random())
    }

    /// Creates the server side of a connection, in response to a
    /// `Connect` frame carrying `client_challenge`.
    #[must_use]
    pub fn new_server(config: Config, now: Instant, client_challenge: u32) -> Self {
        let mut conn = Self::new(config, Role::Server, now, rand::random());
        conn.peer_challenge = Some(client_challenge);
        conn
    }

    /// Gets the current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    /// Gets why the connection closed, if it has.
    #[must_use]
    pub const fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason
    }

    /// Gets a snapshot of the connection statistics.
    #[must_use]
    pub fn stats(&self) -> ConnStats {
        let mut stats = self.stats;
        stats.rtt = self.rtt.get();
        stats.rtt_var = self.rtt.var();
        stats.cwnd = self.cwnd.window();
        stats.in_flight = self.cwnd.in_flight();
        stats
    }

    /// Gets the number of messages queued but not yet put on the wire.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.sched.len() + self.ready_frames.len() + self.resend_queue.len()
    }

    /// Takes the next event the application should see.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Replaces the send simulator configuration.
    ///
    /// Datagrams already sitting in the old simulator's delay queue are
    /// discarded - to the peer this is indistinguishable from loss.
    pub fn set_simulator(&mut self, config: SimulatorConfig) {
        self.sim = config.enabled.then(|| Simulator::new(config));
    }

    /// Queues an application message for sending.
    ///
    /// Returns `false` (and drops the message) if the connection is
    /// closed. Messages queued while the handshake is still pending are
    /// held until it completes.
    pub fn enqueue(&mut self, msg: OutboundMessage) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.sched.push(msg);
        true
    }

    /// Initiates a graceful shutdown. Idempotent.
    ///
    /// The connection drains its in-flight reliable messages, tells the
    /// peer, and reaches [`ConnState::Closed`] no later than the
    /// disconnect grace period from now.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnState::Closed | ConnState::Disconnecting => {}
            ConnState::Pending => {
                // nothing is in flight yet; close on the spot
                self.teardown(DisconnectReason::LocalClose);
            }
            ConnState::Ok => {
                debug!("disconnecting");
                self.state = ConnState::Disconnecting;
                self.disconnect_started = Some(now);
            }
        }
    }

    /// Advances timers: handshake and disconnect progress,
    /// retransmissions, keepalive, fragment expiry, and chain reclaim.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Pending => {
                if now.duration_since(self.created_at) >= self.config.handshake_timeout {
                    debug!("handshake timed out");
                    self.teardown(DisconnectReason::HandshakeTimeout);
                }
                return;
            }
            ConnState::Ok | ConnState::Disconnecting => {}
        }

        self.check_retransmits(now);

        let expired = self.frag_recv.expire(now, self.config.fragment_timeout);
        if expired > 0 {
            trace!(expired, "discarded incomplete fragment transfers");
        }
        self.chains.reclaim_idle(now, self.config.chain_idle_grace);

        // a ping whose pong never came stops blocking further keepalives
        if let Some((_, sent_at)) = self.outstanding_ping {
            if now.duration_since(sent_at) >= self.config.keepalive_interval * 2 {
                self.outstanding_ping = None;
            }
        }
        if self.state == ConnState::Ok
            && now.duration_since(self.last_send) >= self.config.keepalive_interval
            && now.duration_since(self.last_recv) >= self.config.keepalive_interval
            && self.outstanding_ping.is_none()
        {
            let nonce = self.next_ping_nonce;
            self.next_ping_nonce = self.next_ping_nonce.wrapping_add(1);
            self.outstanding_ping = Some((nonce, now));
            self.control_queue.push_back(Control::Ping { nonce });
        }

        if self.state == ConnState::Disconnecting {
            self.tick_disconnect(now);
        }
    }

    fn tick_disconnect(&mut self, now: Instant) {
        let started = self
            .disconnect_started
            .expect("disconnecting state always has a start time");
        if now.duration_since(started) >= self.config.disconnect_grace {
            debug!("disconnect grace expired");
            self.teardown(DisconnectReason::LocalClose);
            return;
        }

        let drained = self.sent.is_empty()
            && self.resend_queue.is_empty()
            && self.ready_frames.is_empty()
            && self.sched.is_empty();
        if !drained {
            return;
        }
        let resend_due = self
            .disconnect_sent_at
            .is_none_or(|at| now.duration_since(at) >= self.config.handshake_resend);
        if resend_due {
            self.disconnect_sent_at = Some(now);
            self.control_queue.push_back(Control::Disconnect);
        }
    }

    fn check_retransmits(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .sent
            .iter()
            .filter(|(_, datagram)| now >= datagram.rto_at)
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut frames = Vec::new();
        let mut exhausted = false;
        for seq in expired {
            let datagram = self
                .sent
                .remove(&seq)
                .expect("sequence was collected from the table above");
            self.cwnd.on_loss();
            self.stats.retransmits += 1;
            trace!(seq, "retransmission timeout");
            for mut frame in datagram.frames {
                frame.retries += 1;
                exhausted |= frame.retries > self.config.max_retries;
                frames.push(frame);
            }
        }
        // oldest numbers go back to the head of the queue first
        frames.sort_by_key(|frame| frame.header.reliable_num);
        for frame in frames.into_iter().rev() {
            self.resend_queue.push_front(frame);
        }
        if exhausted {
            debug!("a reliable message exhausted its retries");
            self.teardown(DisconnectReason::PeerUnreachable);
        }
    }

    /// Tears the connection down, reporting every pending reliable message
    /// as lost.
    fn teardown(&mut self, reason: DisconnectReason) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(%reason, "connection closed");
        self.state = ConnState::Closed;
        self.close_reason = Some(reason);

        if reason != DisconnectReason::PeerDisconnected && reason != DisconnectReason::LocalClose {
            let sent_frames = self.sent.drain().flat_map(|(_, datagram)| datagram.frames);
            let queued = sent_frames
                .chain(self.resend_queue.drain(..))
                .chain(self.ready_frames.drain(..))
                .filter(|frame| frame.header.reliable_num.is_some())
                .map(|frame| (frame.header.message_id, 0u32))
                .collect::<Vec<_>>();
            for (message_id, content_id) in queued {
                self.report_drop(message_id, content_id, DropReason::ConnectionLost);
            }
        } else {
            self.sent.clear();
            self.resend_queue.clear();
            self.ready_frames.clear();
        }
        self.control_queue.clear();
        self.events.push_back(Event::Disconnected(reason));
    }

    fn report_drop(&mut self, message_id: u32, content_id: u32, reason: DropReason) {
        self.stats.messages_dropped += 1;
        self.events.push_back(Event::Dropped {
            message_id,
            content_id,
            reason,
        });
    }

    /// Gets the earliest instant at which [`Conn::tick`] or
    /// [`Conn::poll_transmit`] may have new work to do.
    #[must_use]
    pub fn next_timeout(&self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |at: Instant| {
            next = Some(next.map_or(at, |cur| cur.min(at)));
        };

        match self.state {
            ConnState::Closed => return None,
            ConnState::Pending => {
                consider(self.created_at + self.config.handshake_timeout);
                consider(
                    self.last_handshake_send
                        .map_or(now, |at| at + self.config.handshake_resend),
                );
            }
            ConnState::Ok | ConnState::Disconnecting => {
                if let Some(rto) = self.sent.values().map(|datagram| datagram.rto_at).min() {
                    consider(rto);
                }
                if let Some(since) = self.ack_pending_since {
                    consider(since + self.config.ack_delay);
                }
                if !self.ready_frames.is_empty()
                    || !self.resend_queue.is_empty()
                    || !self.sched.is_empty()
                {
                    consider(self.next_send_allowed);
                }
                if let Some(started) = self.disconnect_started {
                    consider(started + self.config.disconnect_grace);
                }
            }
        }
        if let Some(at) = self.sim.as_ref().and_then(Simulator::next_release) {
            consider(at);
        }
        next
    }
}

#[cfg(test)]
mod tests;
