//! The network worker: one thread multiplexing every socket the host
//! owns with a readiness poll.
//!
//! The worker owns all protocol engine state exclusively. Application
//! threads talk to it only through the per-connection rings and atomic
//! snapshots, plus a control-plane command queue for connection setup. It
//! never blocks anywhere except in the poll itself, and never holds a lock
//! across it.

use {
    crate::{
        connection::{ConnShared, ConnectionConfig, MessageConnection, Notice},
        host::HostShared,
        tcp::TcpConn,
    },
    ahash::AHashMap,
    mio::{
        Events, Interest, Poll, Token,
        net::{TcpListener, TcpStream, UdpSocket},
    },
    octs::Read,
    std::{
        collections::VecDeque,
        io,
        net::SocketAddr,
        sync::{Arc, atomic::Ordering},
        time::{Duration, Instant},
    },
    tether_proto::{
        conn::{Conn, ConnState, DropReason, Event},
        frame::Frame,
        packet::{Control, DatagramHeader},
        recv::InboundMessage,
    },
    tracing::{debug, trace, warn},
};

/// Token reserved for the host's waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Upper bound on how long the worker sleeps in its readiness poll.
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

/// How long a shutdown may spend draining connections before the worker
/// exits regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(6);

const RECV_BUF: usize = 64 * 1024;

/// Control-plane request from the application to the worker.
pub(crate) enum Command {
    ConnectUdp {
        socket: UdpSocket,
        shared: Arc<ConnShared>,
        config: ConnectionConfig,
    },
    ConnectTcp {
        stream: TcpStream,
        shared: Arc<ConnShared>,
        config: ConnectionConfig,
    },
    ListenUdp {
        socket: UdpSocket,
        config: ConnectionConfig,
    },
    ListenTcp {
        listener: TcpListener,
        config: ConnectionConfig,
    },
}

enum Transport {
    Udp(Conn),
    Tcp { conn: TcpConn, stream: TcpStream },
}

enum Route {
    /// Client-side connection with its own connected socket.
    UdpOwned(UdpSocket),
    /// Server-side connection sharing a listener socket.
    UdpShared { listener: Token, peer: SocketAddr },
    /// Stream connection; the socket lives in [`Transport::Tcp`].
    Tcp,
}

struct Driver {
    transport: Transport,
    route: Route,
    shared: Arc<ConnShared>,
    token: Option<Token>,
    /// Delivered messages that did not fit the inbound ring yet.
    inbound_backlog: VecDeque<InboundMessage>,
    last_state: ConnState,
}

struct UdpListenerState {
    socket: UdpSocket,
    config: ConnectionConfig,
    peers: AHashMap<SocketAddr, u64>,
}

struct TcpListenerState {
    listener: TcpListener,
    config: ConnectionConfig,
}

pub(crate) struct Worker {
    poll: Poll,
    shared: Arc<HostShared>,
    drivers: AHashMap<u64, Driver>,
    tokens: AHashMap<Token, u64>,
    udp_listeners: AHashMap<Token, UdpListenerState>,
    tcp_listeners: AHashMap<Token, TcpListenerState>,
    next_token: usize,
}

/// Reads the challenge out of a datagram if and only if it is a
/// well-formed `Connect`.
fn parse_connect(datagram: &[u8]) -> Option<u32> {
    let mut src = datagram;
    let _ = src.read::<DatagramHeader>().ok()?;
    let frame = src.read::<Frame>().ok()?;
    match Control::from_payload(frame.header.message_id, &frame.payload)? {
        Control::Connect { challenge, .. } => Some(challenge),
        _ => None,
    }
}

impl Worker {
    pub(crate) fn new(poll: Poll, shared: Arc<HostShared>) -> Self {
        Self {
            poll,
            shared,
            drivers: AHashMap::new(),
            tokens: AHashMap::new(),
            udp_listeners: AHashMap::new(),
            tcp_listeners: AHashMap::new(),
            next_token: WAKER_TOKEN.0 + 1,
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut shutdown_at: Option<Instant> = None;
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(%err, "poll failed; worker exiting");
                return;
            }
            let now = Instant::now();

            self.process_commands(now);
            for event in &events {
                self.handle_event(event.token(), event.is_writable(), now);
            }
            self.drive_all(now);
            self.cleanup();

            if self.shared.shutdown.load(Ordering::Acquire) {
                if shutdown_at.is_none() {
                    shutdown_at = Some(now);
                    debug!("shutting down; draining connections");
                    for driver in self.drivers.values_mut() {
                        match &mut driver.transport {
                            Transport::Udp(core) => core.disconnect(now),
                            Transport::Tcp { conn, .. } => conn.disconnect(now),
                        }
                    }
                }
                let at = shutdown_at.expect("set above");
                if self.drivers.is_empty() || now.duration_since(at) >= SHUTDOWN_GRACE {
                    debug!("worker exiting");
                    return;
                }
            }
        }
    }

    fn process_commands(&mut self, now: Instant) {
        loop {
            let command = {
                let mut commands = self
                    .shared
                    .commands
                    .lock()
                    .expect("command queue poisoned");
                commands.pop_front()
            };
            let Some(command) = command else { return };
            if let Err(err) = self.apply_command(command, now) {
                warn!(%err, "failed to apply command");
            }
        }
    }

    fn apply_command(&mut self, command: Command, now: Instant) -> io::Result<()> {
        match command {
            Command::ConnectUdp {
                mut socket,
                shared,
                config,
            } => {
                let token = self.alloc_token();
                self.poll
                    .registry()
                    .register(&mut socket, token, Interest::READABLE)?;
                let id = shared.id;
                debug!(id, peer = %shared.remote_addr, "connecting over udp");
                self.tokens.insert(token, id);
                self.drivers.insert(
                    id,
                    Driver {
                        transport: Transport::Udp(Conn::new_client(config.proto, now)),
                        route: Route::UdpOwned(socket),
                        shared,
                        token: Some(token),
                        inbound_backlog: VecDeque::new(),
                        last_state: ConnState::Pending,
                    },
                );
            }
            Command::ConnectTcp {
                mut stream,
                shared,
                config,
            } => {
                let token = self.alloc_token();
                self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                let id = shared.id;
                debug!(id, peer = %shared.remote_addr, "connecting over tcp");
                self.tokens.insert(token, id);
                let driver = Driver {
                    transport: Transport::Tcp {
                        conn: TcpConn::new(config.proto.disconnect_grace),
                        stream,
                    },
                    route: Route::Tcp,
                    shared,
                    token: Some(token),
                    inbound_backlog: VecDeque::new(),
                    last_state: ConnState::Pending,
                };
                self.drivers.insert(id, driver);
            }
            Command::ListenUdp { mut socket, config } => {
                let token = self.alloc_token();
                self.poll
                    .registry()
                    .register(&mut socket, token, Interest::READABLE)?;
                debug!(addr = ?socket.local_addr(), "listening over udp");
                self.udp_listeners.insert(
                    token,
                    UdpListenerState {
                        socket,
                        config,
                        peers: AHashMap::new(),
                    },
                );
            }
            Command::ListenTcp {
                mut listener,
                config,
            } => {
                let token = self.alloc_token();
                self.poll
                    .registry()
                    .register(&mut listener, token, Interest::READABLE)?;
                debug!(addr = ?listener.local_addr(), "listening over tcp");
                self.tcp_listeners
                    .insert(token, TcpListenerState { listener, config });
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, token: Token, writable: bool, now: Instant) {
        if token == WAKER_TOKEN {
            return;
        }
        if self.udp_listeners.contains_key(&token) {
            self.drain_udp_listener(token, now);
            return;
        }
        if self.tcp_listeners.contains_key(&token) {
            self.accept_tcp_connections(token, now);
            return;
        }
        let Some(id) = self.tokens.get(&token).copied() else {
            return;
        };
        let Some(driver) = self.drivers.get_mut(&id) else {
            return;
        };
        match &mut driver.transport {
            Transport::Udp(core) => {
                let Route::UdpOwned(socket) = &driver.route else {
                    return;
                };
                let mut buf = [0u8; RECV_BUF];
                loop {
                    match socket.recv(&mut buf) {
                        Ok(len) => core.handle_datagram(now, &buf[..len]),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            // e.g. ICMP port unreachable surfaced on the
                            // connected socket; the engine's retry path
                            // decides when to give up
                            trace!(%err, "udp recv failed");
                            break;
                        }
                    }
                }
            }
            Transport::Tcp { conn, stream } => {
                conn.handle_readable(now, stream);
                if writable {
                    conn.flush(stream);
                }
            }
        }
    }

    fn drain_udp_listener(&mut self, token: Token, now: Instant) {
        let mut received: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        {
            let listener = self
                .udp_listeners
                .get(&token)
                .expect("checked by the caller");
            let mut buf = [0u8; RECV_BUF];
            loop {
                match listener.socket.recv_from(&mut buf) {
                    Ok((len, peer)) => received.push((peer, buf[..len].to_vec())),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        trace!(%err, "udp listener recv failed");
                        break;
                    }
                }
            }
        }

        for (peer, datagram) in received {
            let known = self
                .udp_listeners
                .get(&token)
                .and_then(|listener| listener.peers.get(&peer).copied());
            match known {
                Some(id) => {
                    if let Some(driver) = self.drivers.get_mut(&id) {
                        if let Transport::Udp(core) = &mut driver.transport {
                            core.handle_datagram(now, &datagram);
                        }
                    }
                }
                None => self.accept_udp_connection(token, peer, &datagram, now),
            }
        }
    }

    /// A datagram from an endpoint we don't know: it either opens a new
    /// connection with a well-formed `Connect`, or it is ignored.
    fn accept_udp_connection(
        &mut self,
        token: Token,
        peer: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) {
        let Some(challenge) = parse_connect(datagram) else {
            trace!(%peer, "ignoring datagram from unknown endpoint");
            return;
        };
        let id = self.shared.alloc_conn_id();
        let Some(listener) = self.udp_listeners.get_mut(&token) else {
            return;
        };
        debug!(id, %peer, "accepting udp connection");
        let shared = Arc::new(ConnShared::new(
            id,
            peer,
            &listener.config,
            Arc::clone(&self.shared.waker),
        ));
        let handle = MessageConnection::new(Arc::clone(&shared), listener.config.queue_full_policy);

        let mut core = Conn::new_server(listener.config.proto.clone(), now, challenge);
        core.handle_datagram(now, datagram);
        listener.peers.insert(peer, id);
        self.drivers.insert(
            id,
            Driver {
                transport: Transport::Udp(core),
                route: Route::UdpShared {
                    listener: token,
                    peer,
                },
                shared,
                token: None,
                inbound_backlog: VecDeque::new(),
                last_state: ConnState::Pending,
            },
        );
        self.shared.push_new_connection(handle);
    }

    fn accept_tcp_connections(&mut self, token: Token, _now: Instant) {
        loop {
            let accepted = {
                let listener = self
                    .tcp_listeners
                    .get(&token)
                    .expect("checked by the caller");
                listener.listener.accept()
            };
            match accepted {
                Ok((mut stream, peer)) => {
                    let id = self.shared.alloc_conn_id();
                    let stream_token = self.alloc_token();
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        stream_token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%err, "failed to register accepted stream");
                        continue;
                    }
                    let config = &self
                        .tcp_listeners
                        .get(&token)
                        .expect("checked by the caller")
                        .config;
                    debug!(id, %peer, "accepting tcp connection");
                    let shared = Arc::new(ConnShared::new(
                        id,
                        peer,
                        config,
                        Arc::clone(&self.shared.waker),
                    ));
                    let handle =
                        MessageConnection::new(Arc::clone(&shared), config.queue_full_policy);
                    self.tokens.insert(stream_token, id);
                    self.drivers.insert(
                        id,
                        Driver {
                            transport: Transport::Tcp {
                                conn: TcpConn::new(config.proto.disconnect_grace),
                                stream,
                            },
                            route: Route::Tcp,
                            shared,
                            token: Some(stream_token),
                            inbound_backlog: VecDeque::new(),
                            last_state: ConnState::Pending,
                        },
                    );
                    self.shared.push_new_connection(handle);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn drive_all(&mut self, now: Instant) {
        let ids: Vec<u64> = self.drivers.keys().copied().collect();
        for id in ids {
            let Some(driver) = self.drivers.get_mut(&id) else {
                continue;
            };
            Self::drive_driver(driver, &self.udp_listeners, now);
        }
    }

    fn drive_driver(
        driver: &mut Driver,
        udp_listeners: &AHashMap<Token, UdpListenerState>,
        now: Instant,
    ) {
        let shared = &driver.shared;

        // control plane: disconnect requests and simulator updates
        if shared.disconnect_requested.load(Ordering::Acquire) {
            match &mut driver.transport {
                Transport::Udp(core) => core.disconnect(now),
                Transport::Tcp { conn, .. } => conn.disconnect(now),
            }
        }
        if let Some(sim) = shared
            .sim_update
            .lock()
            .expect("simulator lock poisoned")
            .take()
        {
            if let Transport::Udp(core) = &mut driver.transport {
                core.set_simulator(sim);
            }
        }

        // data plane: application -> engine
        while let Some(msg) = shared.outbound.pop() {
            let (reliable, message_id, content_id) = (msg.reliable, msg.message_id, msg.content_id);
            let accepted = match &mut driver.transport {
                Transport::Udp(core) => core.enqueue(msg),
                Transport::Tcp { conn, .. } => conn.enqueue(msg),
            };
            if !accepted && reliable {
                let _ = shared.notices.insert(Notice::Dropped {
                    message_id,
                    content_id,
                    reason: DropReason::ConnectionLost,
                });
            }
        }

        // timers and the wire
        match &mut driver.transport {
            Transport::Udp(core) => {
                core.tick(now);
                while let Some(datagram) = core.poll_transmit(now) {
                    let sent = match &driver.route {
                        Route::UdpOwned(socket) => socket.send(&datagram).map(|_| ()),
                        Route::UdpShared { listener, peer } => udp_listeners
                            .get(listener)
                            .map_or(Ok(()), |l| l.socket.send_to(&datagram, *peer).map(|_| ())),
                        Route::Tcp => Ok(()),
                    };
                    if let Err(err) = sent {
                        // to the protocol this is indistinguishable from
                        // loss, and the reliability layer covers it
                        if err.kind() != io::ErrorKind::WouldBlock {
                            trace!(%err, "udp send failed");
                        }
                    }
                }
            }
            Transport::Tcp { conn, stream } => {
                conn.drive(now);
                conn.flush(stream);
            }
        }

        // engine -> application
        while let Some(front) = driver.inbound_backlog.pop_front() {
            if let Err(back) = shared.inbound.insert(front) {
                driver.inbound_backlog.push_front(back);
                break;
            }
        }
        loop {
            let event = match &mut driver.transport {
                Transport::Udp(core) => core.poll_event(),
                Transport::Tcp { conn, .. } => conn.poll_event(),
            };
            let Some(event) = event else { break };
            match event {
                Event::Connected => {}
                Event::Delivered(msg) => {
                    if driver.inbound_backlog.is_empty() {
                        if let Err(back) = shared.inbound.insert(msg) {
                            driver.inbound_backlog.push_back(back);
                        }
                    } else {
                        driver.inbound_backlog.push_back(msg);
                    }
                }
                Event::Dropped {
                    message_id,
                    content_id,
                    reason,
                } => {
                    let _ = shared.notices.insert(Notice::Dropped {
                        message_id,
                        content_id,
                        reason,
                    });
                }
                Event::Disconnected(_) => {}
            }
        }

        // published snapshots
        let (state, reason, pending) = match &driver.transport {
            Transport::Udp(core) => (core.state(), core.close_reason(), core.num_pending()),
            Transport::Tcp { conn, .. } => (conn.state(), None, conn.num_pending()),
        };
        shared.worker_pending.store(pending, Ordering::Release);
        if let Transport::Udp(core) = &driver.transport {
            *shared.stats.lock().expect("stats lock poisoned") = core.stats();
        }
        if state != driver.last_state {
            driver.last_state = state;
            shared.publish_state(state, reason);
            let _ = shared.notices.insert(Notice::State(state, reason));
        }
    }

    /// Removes drivers whose connection is closed and fully drained.
    fn cleanup(&mut self) {
        let done: Vec<u64> = self
            .drivers
            .iter()
            .filter(|(_, driver)| {
                driver.last_state == ConnState::Closed && driver.inbound_backlog.is_empty()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            let Some(mut driver) = self.drivers.remove(&id) else {
                continue;
            };
            debug!(id, "reclaiming closed connection");
            if let Some(token) = driver.token {
                self.tokens.remove(&token);
            }
            match &mut driver.route {
                Route::UdpOwned(socket) => {
                    let _ = self.poll.registry().deregister(socket);
                }
                Route::UdpShared { listener, peer } => {
                    if let Some(listener) = self.udp_listeners.get_mut(listener) {
                        listener.peers.remove(peer);
                    }
                }
                Route::Tcp => {
                    if let Transport::Tcp { stream, .. } = &mut driver.transport {
                        let _ = self.poll.registry().deregister(stream);
                    }
                }
            }
        }
    }
}
