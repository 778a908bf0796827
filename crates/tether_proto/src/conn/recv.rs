use {
    super::{Conn, ConnState, DisconnectReason, Role, send::control_frame},
    crate::{
        ack::Acknowledge,
        frame::{ChainStamp, Frame, FrameHeader},
        packet::{Control, DatagramHeader, FIRST_USER_MESSAGE_ID},
        recv::InboundMessage,
        seq::PacketSeq,
    },
    bytes::Bytes,
    octs::{Buf, Read},
    std::time::Instant,
    tracing::{debug, trace},
};

impl Conn {
    /// Feeds one received datagram into the engine.
    ///
    /// Malformed datagrams are counted and dropped; they only become fatal
    /// at a sustained rate. Everything the datagram produces comes out of
    /// [`Conn::poll_event`] and [`Conn::poll_transmit`].
    pub fn handle_datagram(&mut self, now: Instant, datagram: &[u8]) {
        if self.state == ConnState::Closed {
            return;
        }
        self.stats.datagrams_recv += 1;
        self.last_recv = now;

        let mut src = datagram;
        let header = match src.read::<DatagramHeader>() {
            Ok(header) => header,
            Err(_) => {
                self.malformed(now);
                return;
            }
        };
        if let Some(acks) = header.acks {
            self.process_acks(now, acks);
        }

        let fresh = self.recv_window.observe(header.seq);
        self.acks.ack(header.seq);
        self.any_recv = true;
        if !fresh {
            trace!(seq = header.seq.0, "dropping duplicate datagram");
            return;
        }
        if header.reliable && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }

        while src.has_remaining() {
            let frame = match src.read::<Frame>() {
                Ok(frame) => frame,
                Err(_) => {
                    self.malformed(now);
                    return;
                }
            };
            self.handle_frame(now, header.seq, frame);
            if self.state == ConnState::Closed {
                return;
            }
        }
    }

    /// Walks the sent-not-acked table, retiring every datagram the peer
    /// reports received. Re-applying an ack section is a no-op.
    fn process_acks(&mut self, now: Instant, acks: Acknowledge) {
        let covered: Vec<u16> = self
            .sent
            .keys()
            .copied()
            .filter(|seq| acks.is_acked(PacketSeq(*seq)))
            .collect();
        for seq in covered {
            let datagram = self
                .sent
                .remove(&seq)
                .expect("sequence was collected from the table above");
            self.cwnd.on_ack();
            if !datagram.retransmission {
                // Karn's rule: only never-retransmitted datagrams produce
                // RTT samples
                self.rtt.update(now.duration_since(datagram.sent_at));
            }
            trace!(seq, rtt = ?self.rtt.get(), "peer acked datagram");
        }
    }

    fn handle_frame(&mut self, now: Instant, seq: PacketSeq, frame: Frame) {
        let header = frame.header;
        if let Some(num) = header.reliable_num {
            if !self.dup.observe(num) {
                trace!(num = num.0, "dropping duplicate reliable message");
                return;
            }
        }

        if header.message_id < FIRST_USER_MESSAGE_ID {
            match Control::from_payload(header.message_id, &frame.payload) {
                Some(control) => self.handle_control(now, control),
                None => self.malformed(now),
            }
            return;
        }

        // a user frame can only mean the peer considers the handshake
        // done; don't make it wait for a straggling handshake frame
        if self.state == ConnState::Pending {
            self.complete_handshake();
        }

        if let Some(info) = header.frag {
            match self
                .frag_recv
                .reassemble(now, header.message_id, header.chain, info, frame.payload)
            {
                Err(err) => {
                    trace!(%err, "bad fragment");
                    self.malformed(now);
                }
                Ok(None) => {}
                Ok(Some(msg)) => self.route_inbound(
                    now,
                    seq,
                    msg.message_id,
                    header.reliable_num.is_some(),
                    msg.chain,
                    msg.payload,
                ),
            }
        } else {
            self.route_inbound(
                now,
                seq,
                header.message_id,
                header.reliable_num.is_some(),
                header.chain,
                frame.payload,
            );
        }
    }

    fn route_inbound(
        &mut self,
        now: Instant,
        seq: PacketSeq,
        message_id: u32,
        reliable: bool,
        chain: Option<ChainStamp>,
        payload: Bytes,
    ) {
        let msg = InboundMessage {
            packet_seq: seq.0,
            message_id,
            payload,
        };
        match chain {
            None => {
                self.stats.messages_delivered += 1;
                self.events.push_back(super::Event::Delivered(msg));
            }
            Some(stamp) => {
                let mut out = Vec::new();
                self.chains.push(now, reliable, stamp, msg, &mut out);
                self.stats.messages_delivered += out.len() as u64;
                self.events
                    .extend(out.into_iter().map(super::Event::Delivered));
            }
        }
    }

    fn handle_control(&mut self, now: Instant, control: Control) {
        match control {
            Control::Connect { .. } => {
                // the client retransmitted its challenge; answer again
                // right away instead of waiting out the resend interval
                if self.role == Role::Server && self.state == ConnState::Pending {
                    self.last_handshake_send = None;
                }
            }
            Control::ConnectAck { echo, challenge, .. } => {
                self.handle_connect_ack(now, echo, challenge);
            }
            Control::Disconnect => {
                debug!("peer is disconnecting");
                let datagram = self.commit(now, vec![control_frame(Control::DisconnectAck)], false);
                self.outbox.push_back(datagram);
                self.teardown(DisconnectReason::PeerDisconnected);
            }
            Control::DisconnectAck => {
                if self.state == ConnState::Disconnecting {
                    self.teardown(DisconnectReason::LocalClose);
                }
            }
            Control::Ping { nonce } => {
                self.control_queue.push_back(Control::Pong { nonce });
            }
            Control::Pong { nonce } => {
                if let Some((expected, sent_at)) = self.outstanding_ping {
                    if nonce == expected {
                        self.outstanding_ping = None;
                        self.rtt.update(now.duration_since(sent_at));
                    }
                }
            }
            Control::FlowControl { max_send_rate } => {
                self.peer_rate_cap = (max_send_rate > 0).then_some(max_send_rate);
            }
        }
    }

    fn handle_connect_ack(&mut self, now: Instant, echo: u32, challenge: u32) {
        if self.state != ConnState::Pending {
            return;
        }
        if echo != self.our_challenge {
            debug!("handshake echoed a stale challenge");
            self.malformed(now);
            return;
        }
        match self.role {
            Role::Client => {
                self.peer_challenge = Some(challenge);
                self.complete_handshake();
                // confirm the server's challenge with our first reliable
                // frame; the server completes its side on receiving it
                let confirm = Control::ConnectAck {
                    echo: challenge,
                    challenge: self.our_challenge,
                    version: self.config.protocol_version,
                };
                let num = self.alloc_reliable_num();
                self.ready_frames.push_front(super::PendingFrame {
                    header: FrameHeader {
                        message_id: confirm.message_id(),
                        reliable_num: Some(num),
                        chain: None,
                        frag: None,
                    },
                    payload: confirm.to_payload(),
                    retries: 0,
                });
            }
            Role::Server => self.complete_handshake(),
        }
    }

    pub(super) fn complete_handshake(&mut self) {
        if self.state != ConnState::Pending {
            return;
        }
        debug!("handshake complete");
        self.state = ConnState::Ok;
        self.events.push_back(super::Event::Connected);
    }

    /// Counts one malformed packet, tearing the connection down if the
    /// rate over the configured window is exceeded.
    pub(super) fn malformed(&mut self, now: Instant) {
        self.stats.malformed_packets += 1;
        self.malformed_times.push_back(now);
        while self
            .malformed_times
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.malformed_window)
        {
            self.malformed_times.pop_front();
        }
        if self.malformed_times.len() > self.config.malformed_burst as usize {
            debug!("sustained malformed traffic");
            self.teardown(DisconnectReason::MalformedPackets);
        }
    }
}
