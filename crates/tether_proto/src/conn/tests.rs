use {
    super::*,
    crate::{frame::Frame, packet::DatagramHeader},
    octs::Read,
    std::time::Duration,
};

const STEP: Duration = Duration::from_millis(5);

fn outbound(message_id: u32, payload: &[u8], now: Instant) -> OutboundMessage {
    OutboundMessage {
        message_id,
        payload: Bytes::copy_from_slice(payload),
        priority: 0,
        reliable: true,
        in_order: false,
        content_id: 0,
        send_deadline: None,
        created_at: now,
    }
}

fn extract_connect_challenge(datagram: &[u8]) -> Option<u32> {
    let mut src = datagram;
    let _ = src.read::<DatagramHeader>().ok()?;
    let frame = src.read::<Frame>().ok()?;
    match Control::from_payload(frame.header.message_id, &frame.payload)? {
        Control::Connect { challenge, .. } => Some(challenge),
        _ => None,
    }
}

/// A client and server wired memory-to-memory, with a manually advanced
/// clock.
struct Pair {
    client: Conn,
    server: Option<Conn>,
    server_config: Config,
    now: Instant,
}

impl Pair {
    fn new(client_config: Config, server_config: Config) -> Self {
        let now = Instant::now();
        Self {
            client: Conn::new_client(client_config, now),
            server: None,
            server_config,
            now,
        }
    }

    fn server(&mut self) -> &mut Conn {
        self.server.as_mut().expect("server not spawned yet")
    }

    /// Shuttles every pending datagram in both directions.
    fn pump(&mut self) {
        while let Some(datagram) = self.client.poll_transmit(self.now) {
            match &mut self.server {
                Some(server) => server.handle_datagram(self.now, &datagram),
                None => {
                    if let Some(challenge) = extract_connect_challenge(&datagram) {
                        let mut server =
                            Conn::new_server(self.server_config.clone(), self.now, challenge);
                        server.handle_datagram(self.now, &datagram);
                        self.server = Some(server);
                    }
                }
            }
        }
        if let Some(server) = &mut self.server {
            while let Some(datagram) = server.poll_transmit(self.now) {
                self.client.handle_datagram(self.now, &datagram);
            }
        }
    }

    fn advance(&mut self, by: Duration) {
        let deadline = self.now + by;
        while self.now < deadline {
            self.now += STEP;
            self.client.tick(self.now);
            if let Some(server) = &mut self.server {
                server.tick(self.now);
            }
            self.pump();
        }
    }

    fn connect(&mut self) {
        self.pump();
        self.advance(Duration::from_millis(100));
        assert_eq!(ConnState::Ok, self.client.state());
        assert_eq!(ConnState::Ok, self.server().state());
    }
}

fn drain_delivered(conn: &mut Conn) -> Vec<InboundMessage> {
    let mut out = Vec::new();
    while let Some(event) = conn.poll_event() {
        if let Event::Delivered(msg) = event {
            out.push(msg);
        }
    }
    out
}

fn counters(msgs: &[InboundMessage]) -> Vec<u32> {
    msgs.iter()
        .map(|msg| {
            u32::from_le_bytes(
                msg.payload[..]
                    .try_into()
                    .expect("payload is a 4-byte counter"),
            )
        })
        .collect()
}

#[test]
fn handshake_completes() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    let client_connected = std::iter::from_fn(|| pair.client.poll_event())
        .any(|event| matches!(event, Event::Connected));
    assert!(client_connected);
    let server_connected = std::iter::from_fn(|| pair.server().poll_event())
        .any(|event| matches!(event, Event::Connected));
    assert!(server_connected);
}

#[test]
fn handshake_times_out_without_peer() {
    let now = Instant::now();
    let mut client = Conn::new_client(Config::default(), now);
    let _ = client.poll_transmit(now);

    client.tick(now + Duration::from_secs(6));
    assert_eq!(ConnState::Closed, client.state());
    assert_eq!(Some(DisconnectReason::HandshakeTimeout), client.close_reason());
}

#[test]
fn reliable_message_delivered_exactly_once() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    pair.client
        .enqueue(outbound(10, b"hello", pair.now));
    pair.advance(Duration::from_secs(2));

    let delivered = drain_delivered(pair.server());
    assert_eq!(1, delivered.len());
    assert_eq!(10, delivered[0].message_id);
    assert_eq!(&b"hello"[..], &delivered[0].payload);

    // everything is acked; nothing left in flight
    assert_eq!(0, pair.client.frames_in_flight());
    assert_eq!(0, pair.client.num_pending());
}

#[test]
fn replayed_datagrams_do_not_duplicate_delivery() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    pair.client.enqueue(outbound(10, b"once", pair.now));

    // capture the client's datagrams so we can replay them later
    let mut captured = Vec::new();
    for _ in 0..400 {
        pair.now += STEP;
        let now = pair.now;
        pair.client.tick(now);
        pair.server().tick(now);
        while let Some(datagram) = pair.client.poll_transmit(now) {
            captured.push(datagram.clone());
            let server = pair.server();
            server.handle_datagram(now, &datagram);
        }
        while let Some(datagram) = pair.server().poll_transmit(now) {
            pair.client.handle_datagram(now, &datagram);
        }
    }
    assert_eq!(1, drain_delivered(pair.server()).len());

    // replaying any subset of previously received datagrams must deliver
    // nothing new, and acks must stay idempotent
    let now = pair.now;
    for datagram in &captured {
        pair.server().handle_datagram(now, datagram);
    }
    for datagram in captured.iter().rev() {
        pair.server().handle_datagram(now, datagram);
    }
    assert!(drain_delivered(pair.server()).is_empty());
}

#[test]
fn in_order_chain_under_loss() {
    let mut client_config = Config::default();
    client_config.simulator = SimulatorConfig {
        enabled: true,
        constant_delay: Duration::from_millis(50),
        random_delay: Duration::from_millis(100),
        packet_loss_rate: 0.10,
        seed: 7,
    };
    let mut pair = Pair::new(client_config, Config::default());
    pair.pump();
    pair.advance(Duration::from_secs(2));
    assert_eq!(ConnState::Ok, pair.client.state());

    const COUNT: u32 = 2000;
    for counter in 1..=COUNT {
        // in-order on the default chain: a non-zero content id would
        // coalesce the unsent counters away
        pair.client.enqueue(OutboundMessage {
            message_id: 10,
            payload: Bytes::copy_from_slice(&counter.to_le_bytes()),
            priority: 0,
            reliable: true,
            in_order: true,
            content_id: 0,
            send_deadline: None,
            created_at: pair.now,
        });
    }
    pair.advance(Duration::from_secs(120));

    let delivered = counters(&drain_delivered(pair.server()));
    let expected: Vec<u32> = (1..=COUNT).collect();
    assert_eq!(expected, delivered);
}

#[test]
fn chains_do_not_block_each_other() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    // two rounds with a flush in between, so the second message of each
    // chain cannot coalesce into the (already sent) first one
    for counter in 1..=2u32 {
        for content_id in [1u32, 2] {
            pair.client.enqueue(OutboundMessage {
                message_id: 20 + content_id,
                payload: Bytes::copy_from_slice(&counter.to_le_bytes()),
                priority: 0,
                reliable: true,
                in_order: true,
                content_id,
                send_deadline: None,
                created_at: pair.now,
            });
        }
        pair.advance(Duration::from_secs(2));
    }

    let delivered = drain_delivered(pair.server());
    assert_eq!(4, delivered.len());
    let chain_one: Vec<u32> = counters(
        &delivered
            .iter()
            .filter(|msg| msg.message_id == 21)
            .cloned()
            .collect::<Vec<_>>(),
    );
    let chain_two: Vec<u32> = counters(
        &delivered
            .iter()
            .filter(|msg| msg.message_id == 22)
            .cloned()
            .collect::<Vec<_>>(),
    );
    assert_eq!(vec![1, 2], chain_one);
    assert_eq!(vec![1, 2], chain_two);
}

#[test]
fn large_message_fragments_and_reassembles() {
    let mut client_config = Config::default();
    client_config.simulator = SimulatorConfig {
        enabled: true,
        constant_delay: Duration::from_millis(10),
        random_delay: Duration::from_millis(20),
        packet_loss_rate: 0.2,
        seed: 3,
    };
    let mut pair = Pair::new(client_config, Config::default());
    pair.pump();
    pair.advance(Duration::from_secs(2));

    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    pair.client.enqueue(outbound(30, &payload, pair.now));
    pair.advance(Duration::from_secs(120));

    let delivered = drain_delivered(pair.server());
    assert_eq!(1, delivered.len());
    assert_eq!(&payload[..], &delivered[0].payload);
}

#[test]
fn content_id_coalescing_sends_only_newest() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();
    // drain the handshake events
    let _ = drain_delivered(pair.server());

    let mut state_update = outbound(40, b"state-1", pair.now);
    state_update.content_id = 9;
    pair.client.enqueue(state_update);
    let mut state_update = outbound(40, b"state-2", pair.now);
    state_update.content_id = 9;
    pair.client.enqueue(state_update);
    pair.advance(Duration::from_secs(2));

    let delivered = drain_delivered(pair.server());
    assert_eq!(1, delivered.len());
    assert_eq!(&b"state-2"[..], &delivered[0].payload);
}

#[test]
fn expired_deadline_reported_not_sent() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    let mut stale = outbound(50, b"stale", pair.now);
    stale.send_deadline = Some(pair.now + Duration::from_millis(1));
    pair.client.enqueue(stale);

    // make sure the deadline passes before the pacer lets anything out
    pair.now += Duration::from_secs(1);
    pair.advance(Duration::from_secs(1));

    let dropped = std::iter::from_fn(|| pair.client.poll_event()).any(|event| {
        matches!(
            event,
            Event::Dropped {
                message_id: 50,
                reason: DropReason::DeadlineExpired,
                ..
            }
        )
    });
    assert!(dropped);
    assert!(drain_delivered(pair.server()).is_empty());
}

#[test]
fn total_blackout_declares_peer_unreachable() {
    let mut client_config = Config::default();
    client_config.max_retries = 3;
    let mut pair = Pair::new(client_config, Config::default());
    pair.connect();

    pair.client.set_simulator(SimulatorConfig {
        enabled: true,
        packet_loss_rate: 1.0,
        ..SimulatorConfig::default()
    });
    pair.client.enqueue(outbound(60, b"into the void", pair.now));
    pair.advance(Duration::from_secs(30));

    assert_eq!(ConnState::Closed, pair.client.state());
    assert_eq!(
        Some(DisconnectReason::PeerUnreachable),
        pair.client.close_reason()
    );
    let lost = std::iter::from_fn(|| pair.client.poll_event()).any(|event| {
        matches!(
            event,
            Event::Dropped {
                message_id: 60,
                reason: DropReason::ConnectionLost,
                ..
            }
        )
    });
    assert!(lost);
}

#[test]
fn graceful_disconnect_closes_both_sides() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    pair.client.enqueue(outbound(70, b"last words", pair.now));
    pair.advance(Duration::from_secs(1));
    assert_eq!(1, drain_delivered(pair.server()).len());

    pair.client.disconnect(pair.now);
    // a second call must be harmless
    pair.client.disconnect(pair.now);
    pair.advance(Duration::from_secs(5));

    assert_eq!(ConnState::Closed, pair.client.state());
    assert_eq!(Some(DisconnectReason::LocalClose), pair.client.close_reason());
    assert_eq!(ConnState::Closed, pair.server().state());
    assert_eq!(
        Some(DisconnectReason::PeerDisconnected),
        pair.server().close_reason()
    );

    // a clean shutdown loses nothing
    let client_dropped = std::iter::from_fn(|| pair.client.poll_event())
        .any(|event| matches!(event, Event::Dropped { .. }));
    assert!(!client_dropped);
}

#[test]
fn sustained_malformed_traffic_tears_down() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    for _ in 0..12 {
        let garbage = [0xFFu8];
        let now = pair.now;
        pair.server().handle_datagram(now, &garbage);
    }
    assert_eq!(ConnState::Closed, pair.server().state());
    assert_eq!(
        Some(DisconnectReason::MalformedPackets),
        pair.server().close_reason()
    );
}

#[test]
fn single_malformed_packet_is_tolerated() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    let now = pair.now;
    pair.server().handle_datagram(now, &[0xFFu8]);
    assert_eq!(ConnState::Ok, pair.server().state());

    // traffic still flows afterwards
    pair.client.enqueue(outbound(80, b"still here", pair.now));
    pair.advance(Duration::from_secs(1));
    assert_eq!(1, drain_delivered(pair.server()).len());
}

#[test]
fn messages_enqueued_while_pending_flow_after_handshake() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.client.enqueue(outbound(90, b"early bird", pair.now));
    pair.connect();
    pair.advance(Duration::from_secs(1));

    let delivered = drain_delivered(pair.server());
    assert_eq!(1, delivered.len());
    assert_eq!(&b"early bird"[..], &delivered[0].payload);
}

#[test]
fn higher_priority_messages_sent_first() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    let mut low = outbound(100, b"low", pair.now);
    low.priority = 1;
    let mut high = outbound(101, b"high", pair.now);
    high.priority = 10;
    pair.client.enqueue(low);
    pair.client.enqueue(high);
    pair.advance(Duration::from_secs(1));

    let delivered = drain_delivered(pair.server());
    assert_eq!(2, delivered.len());
    assert_eq!(101, delivered[0].message_id);
    assert_eq!(100, delivered[1].message_id);
}

#[test]
fn idle_connection_stays_alive() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.connect();

    pair.advance(Duration::from_secs(10));
    assert_eq!(ConnState::Ok, pair.client.state());
    assert_eq!(ConnState::Ok, pair.server().state());

    // keepalives kept the path warm in both directions
    assert!(pair.client.stats().datagrams_recv > 0);
}
