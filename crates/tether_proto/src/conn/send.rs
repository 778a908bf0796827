use {
    super::{Conn, ConnState, DropReason, PendingFrame, Role, SentDatagram},
    crate::{
        frame::{ChainStamp, Frame, FrameHeader},
        packet::{Control, DatagramHeader},
        sched::Popped,
        seq::{MessageNum, PacketSeq},
    },
    bytes::Bytes,
    octs::{EncodeLen, FixedEncodeLenHint, Write},
    std::time::{Duration, Instant},
    tracing::{trace, warn},
};

/// Builds a [`PendingFrame`] carrying a control message.
pub(super) fn control_frame(control: Control) -> PendingFrame {
    PendingFrame {
        header: FrameHeader {
            message_id: control.message_id(),
            reliable_num: None,
            chain: None,
            frag: None,
        },
        payload: control.to_payload(),
        retries: 0,
    }
}

fn frame_len(frame: &PendingFrame) -> usize {
    Frame {
        header: frame.header,
        payload: frame.payload.clone(),
    }
    .encode_len()
}

impl Conn {
    /// Takes the next datagram to put on the wire, if any.
    ///
    /// Call this repeatedly until it returns [`None`]. When the send
    /// simulator is enabled, built datagrams detour through its delay
    /// queue, and this returns only those whose release time has passed.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        loop {
            if let Some(datagram) = self.sim.as_mut().and_then(|sim| sim.pop_due(now)) {
                return Some(datagram);
            }
            let datagram = self
                .outbox
                .pop_front()
                .or_else(|| self.build_datagram(now))?;
            match &mut self.sim {
                Some(sim) => sim.offer(now, datagram),
                None => return Some(datagram),
            }
        }
    }

    fn build_datagram(&mut self, now: Instant) -> Option<Bytes> {
        match self.state {
            ConnState::Closed => None,
            ConnState::Pending => self.build_handshake(now),
            ConnState::Ok | ConnState::Disconnecting => self.build_data(now),
        }
    }

    fn build_handshake(&mut self, now: Instant) -> Option<Bytes> {
        let due = self
            .last_handshake_send
            .is_none_or(|at| now.duration_since(at) >= self.config.handshake_resend);
        if !due {
            return None;
        }
        let control = match self.role {
            Role::Client => Control::Connect {
                challenge: self.our_challenge,
                version: self.config.protocol_version,
            },
            Role::Server => Control::ConnectAck {
                echo: self
                    .peer_challenge
                    .expect("server connections are created from a received challenge"),
                challenge: self.our_challenge,
                version: self.config.protocol_version,
            },
        };
        self.last_handshake_send = Some(now);
        trace!(id = control.message_id(), "sending handshake frame");
        Some(self.commit(now, vec![control_frame(control)], false))
    }

    fn build_data(&mut self, now: Instant) -> Option<Bytes> {
        let budget = self.config.max_datagram_payload;
        let mut used = DatagramHeader::MAX_ENCODE_LEN;
        let mut frames = Vec::new();

        // control frames ride outside the congestion window
        while let Some(control) = self.control_queue.front().copied() {
            let frame = control_frame(control);
            let len = frame_len(&frame);
            if used + len > budget {
                break;
            }
            used += len;
            frames.push(frame);
            self.control_queue.pop_front();
        }

        let mut paced = false;
        if now >= self.next_send_allowed && self.cwnd.can_send() {
            loop {
                // frames knocked loose by a retransmission timeout go to
                // the head of the line
                if let Some(front) = self.resend_queue.front() {
                    let len = frame_len(front);
                    if used + len > budget {
                        break;
                    }
                    let frame = self
                        .resend_queue
                        .pop_front()
                        .expect("front was just observed");
                    used += len;
                    frames.push(frame);
                    paced = true;
                    continue;
                }
                if self.ready_frames.is_empty() {
                    if !self.pull_from_scheduler(now) {
                        break;
                    }
                    continue;
                }
                let len = frame_len(
                    self.ready_frames
                        .front()
                        .expect("checked non-empty above"),
                );
                if used + len > budget {
                    break;
                }
                let frame = self
                    .ready_frames
                    .pop_front()
                    .expect("front was just observed");
                used += len;
                frames.push(frame);
                paced = true;
            }
        }

        let ack_due = self
            .ack_pending_since
            .is_some_and(|since| now.duration_since(since) >= self.config.ack_delay);
        if frames.is_empty() && !ack_due {
            return None;
        }
        Some(self.commit(now, frames, paced))
    }

    /// Stamps and frames the next scheduled message, if any. Returns
    /// whether the scheduler yielded anything at all.
    fn pull_from_scheduler(&mut self, now: Instant) -> bool {
        match self.sched.pop(now) {
            None => false,
            Some(Popped::Expired(msg)) => {
                trace!(msg.message_id, "dropping message past its send deadline");
                if msg.reliable {
                    self.report_drop(msg.message_id, msg.content_id, DropReason::DeadlineExpired);
                } else {
                    self.stats.messages_dropped += 1;
                }
                true
            }
            Some(Popped::Ready(msg)) => {
                self.stamp(msg);
                true
            }
        }
    }

    fn stamp(&mut self, msg: crate::sched::OutboundMessage) {
        // in-order messages ride the chain of their content id; the +1
        // keeps content id 0 (no coalescing) off the reserved wire value
        let chain = msg.in_order.then(|| {
            let chain_id = msg.content_id.wrapping_add(1).max(1);
            ChainStamp {
                chain_id,
                chain_seq: self.sched.next_chain_seq(chain_id),
            }
        });
        self.stats.messages_sent += 1;

        if msg.payload.len() > self.frag_send.max_frag_len() {
            let split_result = self
                .frag_send
                .split(&msg.payload)
                .map(|frags| frags.collect::<Vec<_>>());
            let split = match split_result {
                Ok(frags) => frags,
                Err(err) => {
                    warn!(%err, msg.message_id, "message cannot be sent");
                    self.report_drop(msg.message_id, msg.content_id, DropReason::TooLarge);
                    return;
                }
            };
            // fragments are always reliable: losing one would lose the
            // whole message no matter what the application asked for
            for (info, chunk) in split {
                let num = self.alloc_reliable_num();
                self.ready_frames.push_back(PendingFrame {
                    header: FrameHeader {
                        message_id: msg.message_id,
                        reliable_num: Some(num),
                        chain,
                        frag: Some(info),
                    },
                    payload: chunk,
                    retries: 0,
                });
            }
        } else {
            let reliable_num = msg.reliable.then(|| self.alloc_reliable_num());
            self.ready_frames.push_back(PendingFrame {
                header: FrameHeader {
                    message_id: msg.message_id,
                    reliable_num,
                    chain,
                    frag: None,
                },
                payload: msg.payload,
                retries: 0,
            });
        }
    }

    pub(super) fn alloc_reliable_num(&mut self) -> MessageNum {
        let num = self.next_reliable_num;
        self.next_reliable_num = num.next();
        num
    }

    /// Serializes `frames` into a datagram, assigning the next sequence
    /// number and entering reliable frames into the sent-not-acked table.
    pub(super) fn commit(&mut self, now: Instant, frames: Vec<PendingFrame>, paced: bool) -> Bytes {
        let seq = self.next_packet_seq;
        self.next_packet_seq = seq + PacketSeq::new(1);

        let reliable: Vec<PendingFrame> = frames
            .iter()
            .filter(|frame| frame.header.reliable_num.is_some())
            .cloned()
            .collect();
        let header = DatagramHeader {
            seq,
            acks: self.any_recv.then_some(self.acks),
            reliable: !reliable.is_empty(),
        };

        let mut buf = Vec::with_capacity(self.config.max_datagram_payload);
        buf.write(&header)
            .expect("should grow the buffer when writing over capacity");
        for frame in &frames {
            buf.write(&Frame {
                header: frame.header,
                payload: frame.payload.clone(),
            })
            .expect("stamped frames always have valid headers");
        }

        if !reliable.is_empty() {
            let retransmission = reliable.iter().any(|frame| frame.retries > 0);
            self.sent.insert(
                seq.0,
                SentDatagram {
                    frames: reliable,
                    sent_at: now,
                    rto_at: now + self.rtt.rto(),
                    retransmission,
                },
            );
            self.cwnd.on_sent();
        }
        if paced {
            let mut interval = self.cwnd.pacing_interval(self.rtt.get());
            if let Some(cap) = self.peer_rate_cap {
                interval = interval.max(Duration::from_secs(1) / cap);
            }
            self.next_send_allowed = now + interval;
        }
        if header.acks.is_some() {
            self.ack_pending_since = None;
        }
        self.last_send = now;
        self.stats.datagrams_sent += 1;
        trace!(
            seq = seq.0,
            frames = frames.len(),
            len = buf.len(),
            "committed datagram"
        );
        Bytes::from(buf)
    }

    /// Advertises a cap on how fast the peer may send to us, in datagrams
    /// per second. 0 lifts the cap.
    pub fn advertise_rate_cap(&mut self, max_send_rate: u32) {
        self.control_queue
            .push_back(Control::FlowControl { max_send_rate });
    }

    /// Number of frames currently sitting in the sent-not-acked table.
    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.sent.values().map(|datagram| datagram.frames.len()).sum()
    }
}
