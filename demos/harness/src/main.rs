//! Client/server harness for exercising `tether` over real sockets.
//!
//! The server echoes every message back to its sender. The client sends a
//! run of reliable in-order counter messages, waits for the echoes, and
//! prints round-trip statistics.
//!
//! Exit codes: 0 on normal termination (including unknown subcommands,
//! which print usage), 1 on usage errors, 2 on network failure.

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand, ValueEnum, error::ErrorKind},
    std::{
        net::{SocketAddr, ToSocketAddrs},
        process::ExitCode,
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    },
    tether::{
        ConnState, ConnectionConfig, MessageConnection, MessageHandler, NetworkHost,
        ServerListener,
    },
    tracing::{info, warn},
};

/// First message id available to the harness (lower ids belong to the
/// engine).
const MSG_COUNTER: u32 = 10;

const CLIENT_MESSAGES: u32 = 1000;

#[derive(Debug, Parser)]
#[command(name = "tether-harness", version, about)]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Accept connections and echo every message back.
    Server {
        /// Transport to listen on.
        #[arg(value_enum)]
        transport: Transport,
        /// Port to listen on.
        port: u16,
    },
    /// Connect, send a counter run, and verify the echoes.
    Client {
        /// Transport to connect over.
        #[arg(value_enum)]
        transport: Transport,
        /// Server host name or address.
        host: String,
        /// Server port.
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                // an unknown subcommand just gets the usage text
                ErrorKind::InvalidSubcommand
                | ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let outcome = match args.role {
        Role::Server { transport, port } => run_server(transport, port),
        Role::Client {
            transport,
            host,
            port,
        } => run_client(transport, &host, port),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!("{err:#}");
            ExitCode::from(2)
        }
    }
}

/// Echo handler: messages are collected here and sent back from the
/// application loop.
#[derive(Clone, Default)]
struct EchoQueue {
    pending: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
}

impl MessageHandler for EchoQueue {
    fn handle_message(
        &mut self,
        _conn: &MessageConnection,
        _packet_id: u16,
        message_id: u32,
        payload: &[u8],
    ) {
        self.pending
            .lock()
            .expect("echo queue poisoned")
            .push((message_id, payload.to_vec()));
    }
}

#[derive(Clone, Default)]
struct AcceptQueue {
    conns: Arc<Mutex<Vec<MessageConnection>>>,
}

impl ServerListener for AcceptQueue {
    fn new_connection_established(&mut self, connection: MessageConnection) {
        info!(peer = %connection.remote_addr(), "connection established");
        self.conns
            .lock()
            .expect("accept queue poisoned")
            .push(connection);
    }
}

fn run_server(transport: Transport, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("building listen address")?;
    let mut host = NetworkHost::new().context("starting network host")?;
    let accept = AcceptQueue::default();
    host.set_listener(Box::new(accept.clone()));

    let bound = match transport {
        Transport::Udp => host
            .listen_udp(addr, ConnectionConfig::default())
            .context("binding udp listener")?,
        Transport::Tcp => host
            .listen_tcp(addr, ConnectionConfig::default())
            .context("binding tcp listener")?,
    };
    info!(%bound, "serving");

    let mut conns: Vec<(MessageConnection, EchoQueue)> = Vec::new();
    loop {
        host.process_events();
        for mut conn in accept.conns.lock().expect("accept queue poisoned").drain(..) {
            let echo = EchoQueue::default();
            conn.set_message_handler(Box::new(echo.clone()));
            conns.push((conn, echo));
        }

        for (conn, echo) in &mut conns {
            conn.process();
            for (message_id, payload) in
                echo.pending.lock().expect("echo queue poisoned").drain(..)
            {
                let mut msg = match conn.start_new_message(message_id, payload.len()) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                msg.write(&payload);
                let msg = msg.with_in_order(true);
                if conn.end_and_queue(msg).is_err() {
                    continue;
                }
            }
        }
        conns.retain(|(conn, _)| {
            let open = conn.connection_state() != ConnState::Closed;
            if !open {
                info!(peer = %conn.remote_addr(), "connection closed");
            }
            open
        });
        thread::sleep(Duration::from_millis(2));
    }
}

/// Verifies the echoed counters arrive strictly in order.
#[derive(Clone, Default)]
struct CounterCheck {
    received: Arc<Mutex<u32>>,
}

impl MessageHandler for CounterCheck {
    fn handle_message(
        &mut self,
        _conn: &MessageConnection,
        _packet_id: u16,
        _message_id: u32,
        payload: &[u8],
    ) {
        let mut received = self.received.lock().expect("counter lock poisoned");
        let counter = payload
            .try_into()
            .map(u32::from_le_bytes)
            .expect("echoed payload is a 4-byte counter");
        assert_eq!(*received + 1, counter, "echo arrived out of order");
        *received = counter;
    }
}

fn run_client(transport: Transport, host_name: &str, port: u16) -> Result<()> {
    let addr = format!("{host_name}:{port}")
        .to_socket_addrs()
        .context("resolving server address")?
        .next()
        .context("server address did not resolve")?;

    let host = NetworkHost::new().context("starting network host")?;
    let mut conn = match transport {
        Transport::Udp => host
            .connect_udp(addr, ConnectionConfig::default())
            .context("connecting over udp")?,
        Transport::Tcp => host
            .connect_tcp(addr, ConnectionConfig::default())
            .context("connecting over tcp")?,
    };
    let check = CounterCheck::default();
    conn.set_message_handler(Box::new(check.clone()));

    let started = Instant::now();
    wait_until(&mut conn, Duration::from_secs(5), |conn| {
        conn.connection_state() == ConnState::Ok
    })
    .context("establishing the connection")?;
    info!(%addr, "connected in {:?}", started.elapsed());

    for counter in 1..=CLIENT_MESSAGES {
        let mut msg = conn
            .start_new_message(MSG_COUNTER, 4)
            .context("starting message")?;
        msg.write(&counter.to_le_bytes());
        let msg = msg.with_in_order(true);
        conn.end_and_queue(msg).context("queueing message")?;
    }

    wait_until(&mut conn, Duration::from_secs(60), |_| {
        *check.received.lock().expect("counter lock poisoned") == CLIENT_MESSAGES
    })
    .context("waiting for echoes")?;

    let stats = conn.stats();
    info!(
        "echoed {CLIENT_MESSAGES} messages in {:?}; rtt {:?}, {} retransmits, loss {:.2}%",
        started.elapsed(),
        stats.rtt,
        stats.retransmits,
        stats.loss_rate() * 100.0,
    );

    conn.disconnect();
    wait_until(&mut conn, Duration::from_secs(6), |conn| {
        conn.connection_state() == ConnState::Closed
    })
    .context("draining the disconnect")?;
    host.shutdown();
    Ok(())
}

fn wait_until(
    conn: &mut MessageConnection,
    timeout: Duration,
    mut cond: impl FnMut(&MessageConnection) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        conn.process();
        if cond(conn) {
            return Ok(());
        }
        if conn.connection_state() == ConnState::Closed {
            bail!(
                "connection closed: {}",
                conn.close_reason()
                    .map_or_else(|| "unknown reason".to_owned(), |reason| reason.to_string())
            );
        }
        if Instant::now() >= deadline {
            bail!("timed out");
        }
        thread::sleep(Duration::from_millis(2));
    }
}
