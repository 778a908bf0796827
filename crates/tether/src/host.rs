//! See [`NetworkHost`].

use {
    crate::{
        connection::{ConnShared, ConnectionConfig, MessageConnection},
        error::{ConnectError, ListenError},
        message::ServerListener,
        worker::{Command, WAKER_TOKEN, Worker},
    },
    mio::{
        Poll, Waker,
        net::{TcpListener, TcpStream, UdpSocket},
    },
    std::{
        collections::VecDeque,
        io,
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
    },
    tracing::debug,
};

/// State shared between the [`NetworkHost`] handle and its worker thread.
pub(crate) struct HostShared {
    pub(crate) waker: Arc<Waker>,
    pub(crate) commands: Mutex<VecDeque<Command>>,
    pub(crate) shutdown: AtomicBool,
    pending_new: Mutex<Vec<MessageConnection>>,
    next_conn_id: AtomicU64,
}

impl HostShared {
    pub(crate) fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn push_new_connection(&self, connection: MessageConnection) {
        self.pending_new
            .lock()
            .expect("new-connection queue poisoned")
            .push(connection);
    }

    fn take_new_connections(&self) -> Vec<MessageConnection> {
        std::mem::take(
            &mut *self
                .pending_new
                .lock()
                .expect("new-connection queue poisoned"),
        )
    }

    fn send_command(&self, command: Command) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.commands
            .lock()
            .expect("command queue poisoned")
            .push_back(command);
        let _ = self.waker.wake();
        true
    }
}

/// Process-wide owner of the network worker, its sockets, and the
/// connection registry.
///
/// One worker thread services every socket cooperatively with a
/// readiness-based poll. The host is a plain value with an explicit
/// lifecycle: create it, connect or listen, pump
/// [`NetworkHost::process_events`] from the application thread, and
/// [`NetworkHost::shutdown`] drains everything.
pub struct NetworkHost {
    shared: Arc<HostShared>,
    worker: Option<thread::JoinHandle<()>>,
    listener: Option<Box<dyn ServerListener + Send>>,
    /// Accepted connections waiting for a listener callback to be set.
    parked: Vec<MessageConnection>,
}

impl NetworkHost {
    /// Creates a host and spawns its network worker.
    ///
    /// # Errors
    ///
    /// Errors if the readiness poll cannot be set up.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let shared = Arc::new(HostShared {
            waker,
            commands: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            pending_new: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("tether-net".into())
            .spawn(move || Worker::new(poll, worker_shared).run())?;

        Ok(Self {
            shared,
            worker: Some(worker),
            listener: None,
            parked: Vec::new(),
        })
    }

    /// Opens a datagram-transport connection to `addr`.
    ///
    /// Returns immediately with the connection in pending state; the
    /// handshake completes (or times out) in the background, observable
    /// through
    /// [`connection_state`](MessageConnection::connection_state).
    ///
    /// # Errors
    ///
    /// Errors if the local socket cannot be set up, or the host is shut
    /// down.
    pub fn connect_udp(
        &self,
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<MessageConnection, ConnectError> {
        let bind = unspecified_for(addr);
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;

        let id = self.shared.alloc_conn_id();
        let shared = Arc::new(ConnShared::new(
            id,
            addr,
            &config,
            Arc::clone(&self.shared.waker),
        ));
        let handle = MessageConnection::new(Arc::clone(&shared), config.queue_full_policy);
        if !self.shared.send_command(Command::ConnectUdp {
            socket,
            shared,
            config,
        }) {
            return Err(ConnectError::HostShutDown);
        }
        Ok(handle)
    }

    /// Opens a stream-transport connection to `addr`.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be set up, or the host is shut down.
    pub fn connect_tcp(
        &self,
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<MessageConnection, ConnectError> {
        let stream = TcpStream::connect(addr).map_err(|err| {
            if err.kind() == io::ErrorKind::ConnectionRefused {
                ConnectError::Refused
            } else {
                ConnectError::Io(err)
            }
        })?;
        let id = self.shared.alloc_conn_id();
        let shared = Arc::new(ConnShared::new(
            id,
            addr,
            &config,
            Arc::clone(&self.shared.waker),
        ));
        let handle = MessageConnection::new(Arc::clone(&shared), config.queue_full_policy);
        if !self.shared.send_command(Command::ConnectTcp {
            stream,
            shared,
            config,
        }) {
            return Err(ConnectError::HostShutDown);
        }
        Ok(handle)
    }

    /// Starts accepting datagram-transport connections on `addr`,
    /// returning the actual bound address (useful with port 0).
    ///
    /// An unknown endpoint becomes a connection by sending a well-formed
    /// `Connect` frame; anything else from unknown endpoints is ignored.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound, or the host is shut down.
    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<SocketAddr, ListenError> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        debug!(%local, "udp listener ready");
        if self.shared.send_command(Command::ListenUdp { socket, config }) {
            Ok(local)
        } else {
            Err(ListenError::HostShutDown)
        }
    }

    /// Starts accepting stream-transport connections on `addr`, returning
    /// the actual bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound, or the host is shut down.
    pub fn listen_tcp(
        &self,
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<SocketAddr, ListenError> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        debug!(%local, "tcp listener ready");
        if self
            .shared
            .send_command(Command::ListenTcp { listener, config })
        {
            Ok(local)
        } else {
            Err(ListenError::HostShutDown)
        }
    }

    /// Registers the callback that receives accepted connections.
    pub fn set_listener(&mut self, listener: Box<dyn ServerListener + Send>) {
        self.listener = Some(listener);
    }

    /// Application-thread pump: hands connections accepted since the last
    /// call to the registered [`ServerListener`].
    ///
    /// Connections accepted while no listener is registered are parked
    /// and delivered once one is set.
    pub fn process_events(&mut self) {
        let mut fresh = self.shared.take_new_connections();
        match self.listener.as_mut() {
            Some(listener) => {
                for connection in self.parked.drain(..).chain(fresh.drain(..)) {
                    listener.new_connection_established(connection);
                }
            }
            None => self.parked.append(&mut fresh),
        }
    }

    /// Shuts the host down: gracefully disconnects every connection,
    /// drains the worker, and joins it.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.shared.waker.wake();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for NetworkHost {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}
