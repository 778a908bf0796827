//! The stream-transport path.
//!
//! TCP already guarantees ordering and reliability, so this path is the
//! degenerate case of the datagram engine: each message frame is preceded
//! by a 2-byte big-endian length, and sequence numbers, acknowledgements,
//! retransmission, and fragmentation all fall away. The outbound
//! scheduler is shared with the datagram path, so priorities and
//! content-id coalescing behave identically on both transports.

use {
    bytes::{Buf, BytesMut},
    mio::net::TcpStream,
    octs::{EncodeLen, Read, Write},
    std::{
        collections::VecDeque,
        io,
        time::{Duration, Instant},
    },
    tether_proto::{
        conn::{ConnState, DisconnectReason, DropReason, Event},
        frame::{ChainStamp, Frame, FrameHeader},
        packet::{Control, FIRST_USER_MESSAGE_ID},
        recv::InboundMessage,
        sched::{OutboundMessage, Popped, Scheduler},
        seq::MessageNum,
    },
    tracing::{debug, trace},
};

/// Largest frame body a 2-byte length prefix can announce.
const MAX_TCP_FRAME: usize = u16::MAX as usize;

const READ_CHUNK: usize = 8 * 1024;

/// Worker-side state of one TCP connection.
#[derive(Debug)]
pub(crate) struct TcpConn {
    sched: Scheduler,
    next_reliable_num: MessageNum,
    state: ConnState,
    close_reason: Option<DisconnectReason>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    events: VecDeque<Event>,
    disconnect_started: Option<Instant>,
    disconnect_sent: bool,
    /// Close as soon as `write_buf` drains.
    close_after_flush: bool,
    disconnect_grace: Duration,
}

impl TcpConn {
    /// Creates the state for an established stream. There is no handshake
    /// on this path: an accepted or connected socket is already a live
    /// connection.
    pub(crate) fn new(disconnect_grace: Duration) -> Self {
        Self {
            sched: Scheduler::new(),
            next_reliable_num: MessageNum::FIRST,
            state: ConnState::Ok,
            close_reason: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            events: VecDeque::new(),
            disconnect_started: None,
            disconnect_sent: false,
            close_after_flush: false,
            disconnect_grace,
        }
    }

    pub(crate) const fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn num_pending(&self) -> usize {
        self.sched.len()
    }

    pub(crate) fn enqueue(&mut self, msg: OutboundMessage) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.sched.push(msg);
        true
    }

    pub(crate) fn disconnect(&mut self, now: Instant) {
        if matches!(self.state, ConnState::Ok) {
            debug!("disconnecting");
            self.state = ConnState::Disconnecting;
            self.disconnect_started = Some(now);
        }
    }

    /// Pulls everything ready out of the scheduler into the write buffer
    /// and advances the disconnect state machine.
    pub(crate) fn drive(&mut self, now: Instant) {
        if self.state == ConnState::Closed {
            return;
        }

        loop {
            match self.sched.pop(now) {
                None => break,
                Some(Popped::Expired(msg)) => {
                    if msg.reliable {
                        self.events.push_back(Event::Dropped {
                            message_id: msg.message_id,
                            content_id: msg.content_id,
                            reason: DropReason::DeadlineExpired,
                        });
                    }
                }
                Some(Popped::Ready(msg)) => self.write_frame(msg),
            }
        }

        if self.state == ConnState::Disconnecting {
            let started = self
                .disconnect_started
                .expect("disconnecting state always has a start time");
            if now.duration_since(started) >= self.disconnect_grace {
                self.teardown(DisconnectReason::LocalClose);
                return;
            }
            if !self.disconnect_sent && self.sched.is_empty() {
                self.disconnect_sent = true;
                self.write_control(Control::Disconnect);
            }
        }
    }

    fn write_frame(&mut self, msg: OutboundMessage) {
        let chain = msg.in_order.then(|| {
            let chain_id = msg.content_id.wrapping_add(1).max(1);
            ChainStamp {
                chain_id,
                chain_seq: self.sched.next_chain_seq(chain_id),
            }
        });
        let reliable_num = msg.reliable.then(|| {
            let num = self.next_reliable_num;
            self.next_reliable_num = num.next();
            num
        });
        let frame = Frame {
            header: FrameHeader {
                message_id: msg.message_id,
                reliable_num,
                chain,
                frag: None,
            },
            payload: msg.payload,
        };

        let body_len = frame.encode_len();
        if body_len > MAX_TCP_FRAME {
            debug!(body_len, "message too large for the stream transport");
            self.events.push_back(Event::Dropped {
                message_id: frame.header.message_id,
                content_id: msg.content_id,
                reason: DropReason::TooLarge,
            });
            return;
        }
        self.push_framed(&frame, body_len);
    }

    fn write_control(&mut self, control: Control) {
        let frame = Frame {
            header: FrameHeader {
                message_id: control.message_id(),
                reliable_num: None,
                chain: None,
                frag: None,
            },
            payload: control.to_payload(),
        };
        self.push_framed(&frame, frame.encode_len());
    }

    fn push_framed(&mut self, frame: &Frame, body_len: usize) {
        self.write_buf
            .extend_from_slice(&(body_len as u16).to_be_bytes());
        self.write_buf
            .write(frame)
            .expect("should grow the buffer when writing over capacity");
    }

    /// Reads everything available off the socket and dispatches complete
    /// frames.
    pub(crate) fn handle_readable(&mut self, now: Instant, stream: &mut TcpStream) {
        // scoped so the io trait cannot collide with `octs::Read` on
        // byte-slice receivers elsewhere in this module
        use std::io::Read as _;

        if self.state == ConnState::Closed {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("peer closed the stream");
                    self.teardown(DisconnectReason::PeerDisconnected);
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // reads can race a still-in-progress non-blocking connect
                Err(err) if err.kind() == io::ErrorKind::NotConnected => break,
                Err(err) => {
                    debug!(%err, "stream read failed");
                    self.teardown(DisconnectReason::PeerUnreachable);
                    return;
                }
            }
        }
        self.parse_frames(now);
    }

    fn parse_frames(&mut self, _now: Instant) {
        loop {
            if self.read_buf.len() < 2 {
                return;
            }
            let body_len = usize::from(u16::from_be_bytes([self.read_buf[0], self.read_buf[1]]));
            if self.read_buf.len() < 2 + body_len {
                return;
            }
            self.read_buf.advance(2);
            let body = self.read_buf.split_to(body_len).freeze();

            let mut src = &body[..];
            let Ok(frame) = src.read::<Frame>() else {
                // a corrupt length-delimited stream cannot be resynced
                debug!("malformed frame on stream transport");
                self.teardown(DisconnectReason::MalformedPackets);
                return;
            };
            self.handle_frame(frame);
            if self.state == ConnState::Closed {
                return;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let header = frame.header;
        if header.message_id < FIRST_USER_MESSAGE_ID {
            match Control::from_payload(header.message_id, &frame.payload) {
                Some(Control::Disconnect) => {
                    debug!("peer is disconnecting");
                    self.write_control(Control::DisconnectAck);
                    self.close_after_flush = true;
                    self.close_reason = Some(DisconnectReason::PeerDisconnected);
                }
                Some(Control::DisconnectAck) => {
                    if self.state == ConnState::Disconnecting {
                        self.teardown(DisconnectReason::LocalClose);
                    }
                }
                Some(Control::Ping { nonce }) => self.write_control(Control::Pong { nonce }),
                Some(_) => {}
                None => {
                    debug!("malformed control frame on stream transport");
                    self.teardown(DisconnectReason::MalformedPackets);
                }
            }
            return;
        }
        trace!(header.message_id, len = frame.payload.len(), "delivered");
        self.events.push_back(Event::Delivered(InboundMessage {
            packet_seq: 0,
            message_id: header.message_id,
            payload: frame.payload,
        }));
    }

    /// Writes as much buffered data to the socket as it will take.
    pub(crate) fn flush(&mut self, stream: &mut TcpStream) {
        use std::io::Write as _;

        if self.state == ConnState::Closed {
            return;
        }
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => {
                    self.teardown(DisconnectReason::PeerUnreachable);
                    return;
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // writes can race a still-in-progress non-blocking connect
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return,
                Err(err) => {
                    debug!(%err, "stream write failed");
                    self.teardown(DisconnectReason::PeerUnreachable);
                    return;
                }
            }
        }
        if self.close_after_flush {
            let reason = self
                .close_reason
                .unwrap_or(DisconnectReason::PeerDisconnected);
            self.teardown(reason);
        }
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(%reason, "stream connection closed");
        self.state = ConnState::Closed;
        self.close_reason = Some(reason);
        self.events.push_back(Event::Disconnected(reason));
    }
}

#[cfg(test)]
mod tests {
    use {super::*, bytes::Bytes};

    fn outbound(message_id: u32, payload: &[u8]) -> OutboundMessage {
        OutboundMessage {
            message_id,
            payload: Bytes::copy_from_slice(payload),
            priority: 0,
            reliable: true,
            in_order: false,
            content_id: 0,
            send_deadline: None,
            created_at: Instant::now(),
        }
    }

    /// Feeds one side's write buffer into the other side's parser,
    /// without sockets.
    fn shuttle(from: &mut TcpConn, to: &mut TcpConn, now: Instant) {
        let bytes = from.write_buf.split().freeze();
        to.read_buf.extend_from_slice(&bytes);
        to.parse_frames(now);
    }

    #[test]
    fn frames_round_trip_in_order() {
        let now = Instant::now();
        let mut a = TcpConn::new(Duration::from_secs(5));
        let mut b = TcpConn::new(Duration::from_secs(5));

        for i in 0..10u32 {
            a.enqueue(outbound(10 + i, &i.to_le_bytes()));
        }
        a.drive(now);
        shuttle(&mut a, &mut b, now);

        let mut ids = Vec::new();
        while let Some(event) = b.poll_event() {
            if let Event::Delivered(msg) = event {
                ids.push(msg.message_id);
            }
        }
        assert_eq!((10..20).collect::<Vec<u32>>(), ids);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let now = Instant::now();
        let mut a = TcpConn::new(Duration::from_secs(5));
        let mut b = TcpConn::new(Duration::from_secs(5));

        a.enqueue(outbound(10, b"split me"));
        a.drive(now);
        let bytes = a.write_buf.split().freeze();

        // deliver byte by byte; the message must arrive exactly once
        let mut delivered = 0;
        for byte in &bytes[..] {
            b.read_buf.extend_from_slice(&[*byte]);
            b.parse_frames(now);
            while let Some(event) = b.poll_event() {
                if let Event::Delivered(_) = event {
                    delivered += 1;
                }
            }
        }
        assert_eq!(1, delivered);
    }

    #[test]
    fn oversized_message_dropped_with_report() {
        let now = Instant::now();
        let mut a = TcpConn::new(Duration::from_secs(5));
        a.enqueue(outbound(10, &vec![0u8; MAX_TCP_FRAME + 1]));
        a.drive(now);

        let dropped = std::iter::from_fn(|| a.poll_event()).any(|event| {
            matches!(
                event,
                Event::Dropped {
                    reason: DropReason::TooLarge,
                    ..
                }
            )
        });
        assert!(dropped);
        assert!(a.write_buf.is_empty());
    }

    #[test]
    fn disconnect_round_trip() {
        let now = Instant::now();
        let mut a = TcpConn::new(Duration::from_secs(5));
        let mut b = TcpConn::new(Duration::from_secs(5));

        a.disconnect(now);
        a.drive(now);
        shuttle(&mut a, &mut b, now);
        // b answers with an ack and closes once it drains
        assert_eq!(Some(DisconnectReason::PeerDisconnected), b.close_reason);
        shuttle(&mut b, &mut a, now);

        assert_eq!(ConnState::Closed, a.state());
        assert_eq!(Some(DisconnectReason::LocalClose), a.close_reason);
    }

    #[test]
    fn coalescing_applies_on_stream_path() {
        let now = Instant::now();
        let mut a = TcpConn::new(Duration::from_secs(5));
        let mut b = TcpConn::new(Duration::from_secs(5));

        let mut first = outbound(10, b"old");
        first.content_id = 3;
        let mut second = outbound(10, b"new");
        second.content_id = 3;
        a.enqueue(first);
        a.enqueue(second);
        a.drive(now);
        shuttle(&mut a, &mut b, now);

        let mut payloads = Vec::new();
        while let Some(event) = b.poll_event() {
            if let Event::Delivered(msg) = event {
                payloads.push(msg.payload);
            }
        }
        assert_eq!(vec![Bytes::from_static(b"new")], payloads);
    }
}
