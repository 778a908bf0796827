//! End-to-end exchanges over real loopback sockets.

use {
    std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    },
    tether::{
        ConnState, ConnectionConfig, MessageConnection, MessageHandler, NetworkHost,
        ServerListener,
    },
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().expect("valid loopback address")
}

/// Collects every delivered `(message_id, payload)` pair.
#[derive(Clone, Default)]
struct Collect {
    msgs: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
}

impl Collect {
    fn take(&self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut *self.msgs.lock().unwrap())
    }

    fn len(&self) -> usize {
        self.msgs.lock().unwrap().len()
    }
}

impl MessageHandler for Collect {
    fn handle_message(
        &mut self,
        _conn: &MessageConnection,
        _packet_id: u16,
        message_id: u32,
        payload: &[u8],
    ) {
        self.msgs.lock().unwrap().push((message_id, payload.to_vec()));
    }
}

/// Stashes accepted connections for the test body to pick up.
#[derive(Clone, Default)]
struct Accept {
    conns: Arc<Mutex<Vec<MessageConnection>>>,
}

impl ServerListener for Accept {
    fn new_connection_established(&mut self, connection: MessageConnection) {
        self.conns.lock().unwrap().push(connection);
    }
}

/// Spins (pumping the host) until `cond` holds or the timeout hits.
fn wait_for(host: &mut NetworkHost, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        host.process_events();
        thread::sleep(Duration::from_millis(2));
    }
}

fn send_text(conn: &mut MessageConnection, message_id: u32, text: &[u8]) {
    let mut msg = conn.start_new_message(message_id, text.len()).unwrap();
    msg.write(text);
    conn.end_and_queue(msg).unwrap();
}

#[test]
fn udp_round_trip_and_clean_shutdown() {
    let mut server = NetworkHost::new().unwrap();
    let accept = Accept::default();
    server.set_listener(Box::new(accept.clone()));
    let addr = server
        .listen_udp(any_port(), ConnectionConfig::default())
        .unwrap();

    let mut client_host = NetworkHost::new().unwrap();
    let mut client = client_host
        .connect_udp(addr, ConnectionConfig::default())
        .unwrap();

    wait_for(&mut server, || {
        client.process();
        client.connection_state() == ConnState::Ok && !accept.conns.lock().unwrap().is_empty()
    });
    let mut server_conn = accept.conns.lock().unwrap().remove(0);
    let server_collect = Collect::default();
    server_conn.set_message_handler(Box::new(server_collect.clone()));

    // client -> server
    send_text(&mut client, 10, b"ping");
    wait_for(&mut server, || {
        server_conn.process();
        server_collect.len() == 1
    });
    assert_eq!(vec![(10, b"ping".to_vec())], server_collect.take());

    // server -> client
    let client_collect = Collect::default();
    client.set_message_handler(Box::new(client_collect.clone()));
    send_text(&mut server_conn, 11, b"pong");
    wait_for(&mut server, || {
        client.process();
        client_collect.len() == 1
    });
    assert_eq!(vec![(11, b"pong".to_vec())], client_collect.take());

    // graceful shutdown reaches both sides well inside the grace period
    client.disconnect();
    wait_for(&mut server, || {
        client.process();
        server_conn.process();
        client.connection_state() == ConnState::Closed
            && server_conn.connection_state() == ConnState::Closed
    });

    client_host.shutdown();
    server.shutdown();
}

#[test]
fn udp_three_clients_with_isolated_in_order_streams() {
    const PER_CLIENT: u32 = 1000;

    let mut server = NetworkHost::new().unwrap();
    let accept = Accept::default();
    server.set_listener(Box::new(accept.clone()));
    let addr = server
        .listen_udp(any_port(), ConnectionConfig::default())
        .unwrap();

    let client_host = NetworkHost::new().unwrap();
    let mut clients: Vec<MessageConnection> = (0..3)
        .map(|_| {
            client_host
                .connect_udp(addr, ConnectionConfig::default())
                .unwrap()
        })
        .collect();

    wait_for(&mut server, || {
        for client in &mut clients {
            client.process();
        }
        clients
            .iter()
            .all(|client| client.connection_state() == ConnState::Ok)
            && accept.conns.lock().unwrap().len() == 3
    });

    // each client tags its counters with its own message id
    for (index, client) in clients.iter_mut().enumerate() {
        let message_id = 100 + index as u32;
        for counter in 1..=PER_CLIENT {
            let mut msg = client.start_new_message(message_id, 4).unwrap();
            msg.write(&counter.to_le_bytes());
            let msg = msg.with_in_order(true);
            client.end_and_queue(msg).unwrap();
        }
    }

    let mut server_conns = std::mem::take(&mut *accept.conns.lock().unwrap());
    let collects: Vec<Collect> = server_conns
        .iter_mut()
        .map(|conn| {
            let collect = Collect::default();
            conn.set_message_handler(Box::new(collect.clone()));
            collect
        })
        .collect();

    wait_for(&mut server, || {
        for conn in &mut server_conns {
            conn.process();
        }
        collects
            .iter()
            .all(|collect| collect.len() == PER_CLIENT as usize)
    });

    // each server-side handler observed exactly one client's stream, in
    // order, with no cross-talk
    for collect in &collects {
        let msgs = collect.take();
        let ids: Vec<u32> = msgs.iter().map(|(id, _)| *id).collect();
        assert_eq!(1, ids.iter().collect::<std::collections::HashSet<_>>().len());
        let counters: Vec<u32> = msgs
            .iter()
            .map(|(_, payload)| u32::from_le_bytes(payload[..].try_into().unwrap()))
            .collect();
        assert_eq!((1..=PER_CLIENT).collect::<Vec<u32>>(), counters);
    }

    client_host.shutdown();
    server.shutdown();
}

#[test]
fn tcp_round_trip() {
    let mut server = NetworkHost::new().unwrap();
    let accept = Accept::default();
    server.set_listener(Box::new(accept.clone()));
    let addr = server
        .listen_tcp(any_port(), ConnectionConfig::default())
        .unwrap();

    let client_host = NetworkHost::new().unwrap();
    let mut client = client_host
        .connect_tcp(addr, ConnectionConfig::default())
        .unwrap();

    wait_for(&mut server, || {
        client.process();
        client.connection_state() == ConnState::Ok && !accept.conns.lock().unwrap().is_empty()
    });
    let mut server_conn = accept.conns.lock().unwrap().remove(0);
    let collect = Collect::default();
    server_conn.set_message_handler(Box::new(collect.clone()));

    for i in 0..50u32 {
        send_text(&mut client, 10, &i.to_le_bytes());
    }
    wait_for(&mut server, || {
        server_conn.process();
        collect.len() == 50
    });
    let counters: Vec<u32> = collect
        .take()
        .iter()
        .map(|(_, payload)| u32::from_le_bytes(payload[..].try_into().unwrap()))
        .collect();
    assert_eq!((0..50).collect::<Vec<u32>>(), counters);

    client_host.shutdown();
    server.shutdown();
}

#[test]
fn udp_large_message_reassembles() {
    let mut server = NetworkHost::new().unwrap();
    let accept = Accept::default();
    server.set_listener(Box::new(accept.clone()));
    let addr = server
        .listen_udp(any_port(), ConnectionConfig::default())
        .unwrap();

    let client_host = NetworkHost::new().unwrap();
    let mut client = client_host
        .connect_udp(addr, ConnectionConfig::default())
        .unwrap();
    wait_for(&mut server, || {
        client.process();
        client.connection_state() == ConnState::Ok && !accept.conns.lock().unwrap().is_empty()
    });
    let mut server_conn = accept.conns.lock().unwrap().remove(0);
    let collect = Collect::default();
    server_conn.set_message_handler(Box::new(collect.clone()));

    let blob: Vec<u8> = (0..40_000u32).map(|i| (i % 247) as u8).collect();
    send_text(&mut client, 42, &blob);
    wait_for(&mut server, || {
        server_conn.process();
        collect.len() == 1
    });
    assert_eq!(vec![(42, blob)], collect.take());

    client_host.shutdown();
    server.shutdown();
}
