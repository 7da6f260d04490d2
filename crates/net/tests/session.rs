use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use tether::{ChannelKind, ConnectionState, MessageKind, NetError, NetworkConfig, NetworkManager};

const TICK: f64 = 0.05;

fn test_config() -> NetworkConfig {
    NetworkConfig {
        server_port: 0,
        ..NetworkConfig::default()
    }
}

fn new_manager(config: NetworkConfig) -> NetworkManager<u64> {
    NetworkManager::new(config).expect("manager startup")
}

fn pump_until(
    server: &mut NetworkManager<u64>,
    client: &mut NetworkManager<u64>,
    max_ticks: usize,
    mut done: impl FnMut(&NetworkManager<u64>, &NetworkManager<u64>) -> bool,
) -> bool {
    for _ in 0..max_ticks {
        server.update(TICK);
        client.update(TICK);
        if done(server, client) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn pump(server: &mut NetworkManager<u64>, client: &mut NetworkManager<u64>, ticks: usize) {
    for _ in 0..ticks {
        server.update(TICK);
        client.update(TICK);
        thread::sleep(Duration::from_millis(1));
    }
}

fn connect_pair(
    server_config: NetworkConfig,
    client_config: NetworkConfig,
) -> (NetworkManager<u64>, NetworkManager<u64>) {
    let mut server = new_manager(server_config);
    server.start_server("127.0.0.1").unwrap();
    let addr = server.server_addr().unwrap().to_string();

    let mut client = new_manager(client_config);
    client.start_client(&addr).unwrap();

    let ok = pump_until(&mut server, &mut client, 400, |s, c| {
        s.client_is_connected(0) && c.local_client_is_connected()
    });
    assert!(ok, "handshake did not complete");
    (server, client)
}

#[test]
fn test_client_connects_to_server() {
    let mut server = new_manager(test_config());
    server.start_server("127.0.0.1").unwrap();
    assert!(server.server_is_running());
    assert_eq!(server.max_clients(), 4);
    let addr = server.server_addr().unwrap().to_string();

    let connected_clients = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&connected_clients);
    server.on_client_connected(move |index| seen.borrow_mut().push(index));

    let mut client = new_manager(test_config());
    let connected = Rc::new(RefCell::new(0u32));
    let count = Rc::clone(&connected);
    client.on_connected_to_server(move || *count.borrow_mut() += 1);

    let started = Rc::new(RefCell::new(None));
    let flag = Rc::clone(&started);
    client
        .start_client_with(&addr, move |ok| *flag.borrow_mut() = Some(ok))
        .unwrap();

    let ok = pump_until(&mut server, &mut client, 400, |s, c| {
        s.client_is_connected(0) && c.local_client_is_connected()
    });
    assert!(ok, "handshake did not complete");

    // extra ticks would surface a duplicate event
    pump(&mut server, &mut client, 10);

    assert_eq!(*connected_clients.borrow(), vec![0]);
    assert_eq!(*connected.borrow(), 1);
    assert_eq!(*started.borrow(), Some(true));
    assert_eq!(client.client_index(), Some(0));
    assert_eq!(server.connected_count(), 1);
}

#[test]
fn test_host_runs_server_and_local_client() {
    let mut host = new_manager(test_config());
    host.start_host("127.0.0.1").unwrap();
    assert!(host.server_is_running());

    let mut ok = false;
    for _ in 0..400 {
        host.update(TICK);
        if host.is_host() && host.client_is_connected(0) && host.local_client_is_connected() {
            ok = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(ok, "host loopback handshake did not complete");
    assert_eq!(host.client_index(), Some(0));

    host.stop_host().unwrap();
    assert!(!host.server_is_running());
    assert!(!host.local_client_is_connected());
}

#[test]
fn test_server_echoes_client_messages() {
    const PING: MessageKind = MessageKind(10);
    const PONG: MessageKind = MessageKind(11);

    let (mut server, mut client) = connect_pair(test_config(), test_config());

    server.register_server_callback(PING, |outbox, index, msg| {
        outbox.send_to_client(index, PONG, ChannelKind::ReliableOrdered, &msg.payload);
    });
    let replies = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&replies);
    client.register_client_callback(PONG, move |_, msg| {
        seen.borrow_mut().push(msg.payload.clone());
    });

    let mut msg = client.create_client_message(PING).expect("client running");
    msg.channel = ChannelKind::ReliableOrdered;
    msg.payload.extend_from_slice(b"hello");
    client.send_from_client(msg);

    let ok = pump_until(&mut server, &mut client, 400, |_, _| {
        !replies.borrow().is_empty()
    });
    assert!(ok, "echo never arrived");
    assert_eq!(replies.borrow()[0], b"hello");

    let ok = pump_until(&mut server, &mut client, 400, |s, c| {
        c.client_pool_stats().outstanding == 0 && s.server_pool_stats().outstanding == 0
    });
    assert!(ok, "pooled messages leaked");
}

#[test]
fn test_reliable_messages_arrive_in_enqueue_order() {
    let (mut server, mut client) = connect_pair(test_config(), test_config());

    let received = Rc::new(RefCell::new(Vec::new()));
    for kind in 1..=5u16 {
        let seen = Rc::clone(&received);
        server.register_server_callback(MessageKind(kind), move |_, _, msg| {
            seen.borrow_mut().push(msg.kind.0);
        });
    }

    for kind in 1..=5u16 {
        let mut msg = client
            .create_client_message(MessageKind(kind))
            .expect("client running");
        msg.channel = ChannelKind::ReliableOrdered;
        client.send_from_client(msg);
    }

    let ok = pump_until(&mut server, &mut client, 400, |_, _| {
        received.borrow().len() == 5
    });
    assert!(ok, "messages missing");
    assert_eq!(*received.borrow(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_full_outbound_queue_drops_the_oldest() {
    let client_config = NetworkConfig {
        client_queue_size: 8,
        ..test_config()
    };
    let (mut server, mut client) = connect_pair(test_config(), client_config);

    let received = Rc::new(RefCell::new(Vec::new()));
    for kind in 1..=9u16 {
        let seen = Rc::clone(&received);
        server.register_server_callback(MessageKind(kind), move |_, _, msg| {
            seen.borrow_mut().push(msg.kind.0);
        });
    }

    let released_before = client.client_pool_stats().released;
    for kind in 1..=9u16 {
        let mut msg = client
            .create_client_message(MessageKind(kind))
            .expect("client running");
        msg.channel = ChannelKind::ReliableOrdered;
        client.send_from_client(msg);
    }
    assert_eq!(client.client_pool_stats().released, released_before + 1);

    let ok = pump_until(&mut server, &mut client, 400, |_, _| {
        received.borrow().len() == 8
    });
    assert!(ok, "messages missing");
    assert_eq!(*received.borrow(), (2..=9).collect::<Vec<u16>>());
}

#[test]
fn test_connection_denied_when_server_full() {
    let server_config = NetworkConfig {
        max_clients: 1,
        ..test_config()
    };
    let (mut server, mut first) = connect_pair(server_config, test_config());
    let addr = server.server_addr().unwrap().to_string();

    let mut second = new_manager(test_config());
    let started = Rc::new(RefCell::new(None));
    let flag = Rc::clone(&started);
    second
        .start_client_with(&addr, move |ok| *flag.borrow_mut() = Some(ok))
        .unwrap();

    let mut denied = false;
    for _ in 0..400 {
        server.update(TICK);
        first.update(TICK);
        second.update(TICK);
        if started.borrow().is_some() {
            denied = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(denied, "deny never reported");
    assert_eq!(*started.borrow(), Some(false));
    assert!(!second.local_client_is_connected());
    assert_eq!(server.connected_count(), 1);
}

#[test]
fn test_disconnect_frees_the_slot_for_the_next_client() {
    let (mut server, mut first) = connect_pair(test_config(), test_config());

    let gone = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&gone);
    server.on_client_disconnected(move |index| seen.borrow_mut().push(index));

    first.stop_client().unwrap();
    let ok = pump_until(&mut server, &mut first, 400, |s, _| !s.client_is_connected(0));
    assert!(ok, "server kept the slot");
    assert_eq!(*gone.borrow(), vec![0]);

    let addr = server.server_addr().unwrap().to_string();
    let mut second = new_manager(test_config());
    second.start_client(&addr).unwrap();
    let ok = pump_until(&mut server, &mut second, 400, |s, c| {
        s.client_is_connected(0) && c.local_client_is_connected()
    });
    assert!(ok, "slot was not reusable");
    assert_eq!(second.client_index(), Some(0));
}

#[test]
fn test_client_times_out_without_server_traffic() {
    let client_config = NetworkConfig {
        timeout: 1.0,
        ..test_config()
    };
    let (server, mut client) = connect_pair(test_config(), client_config);

    let dropped = Rc::new(RefCell::new(0u32));
    let count = Rc::clone(&dropped);
    client.on_disconnected_from_server(move || *count.borrow_mut() += 1);

    // killing the server silences its keepalives
    drop(server);
    for _ in 0..40 {
        client.update(0.1);
    }

    assert!(!client.local_client_is_connected());
    assert_eq!(*dropped.borrow(), 1);
}

#[test]
fn test_connect_attempt_times_out_without_a_server() {
    let client_config = NetworkConfig {
        timeout: 0.5,
        ..test_config()
    };
    let mut client = new_manager(client_config);

    let started = Rc::new(RefCell::new(None));
    let flag = Rc::clone(&started);
    client
        .start_client_with("127.0.0.1:9", move |ok| *flag.borrow_mut() = Some(ok))
        .unwrap();
    assert_eq!(client.client_state(), ConnectionState::Connecting);

    // nothing answers on the discard port
    for _ in 0..40 {
        client.update(TICK);
    }

    assert_eq!(*started.borrow(), Some(false));
    assert!(!client.local_client_is_connected());
    assert_eq!(client.client_state(), ConnectionState::Disconnected);

    // a fresh attempt is accepted after the failed one
    client.start_client("127.0.0.1:9").unwrap();
    assert_eq!(client.client_state(), ConnectionState::Connecting);
}

#[test]
fn test_reliable_channel_survives_packet_loss() {
    let (mut server, mut client) = connect_pair(test_config(), test_config());

    let received = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&received);
    server.register_server_callback(MessageKind(77), move |_, _, msg| {
        seen.borrow_mut().push(msg.payload[0]);
    });

    client.set_client_loss(0.25);
    server.set_server_loss(0.25);

    for i in 0..20u8 {
        let mut msg = client
            .create_client_message(MessageKind(77))
            .expect("client running");
        msg.channel = ChannelKind::ReliableOrdered;
        msg.payload.push(i);
        client.send_from_client(msg);
    }

    let ok = pump_until(&mut server, &mut client, 2000, |_, _| {
        received.borrow().len() == 20
    });
    assert!(ok, "reliable messages lost for good");
    assert_eq!(*received.borrow(), (0..20).collect::<Vec<u8>>());
}

#[test]
fn test_stopping_the_server_disconnects_clients() {
    let (mut server, mut client) = connect_pair(test_config(), test_config());

    let dropped = Rc::new(RefCell::new(0u32));
    let count = Rc::clone(&dropped);
    client.on_disconnected_from_server(move || *count.borrow_mut() += 1);

    server.stop_server().unwrap();
    let mut ok = false;
    for _ in 0..400 {
        client.update(TICK);
        if !client.local_client_is_connected() {
            ok = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(ok, "client never noticed the shutdown");
    assert_eq!(*dropped.borrow(), 1);
    assert!(client.stop_client().is_ok());
}

#[test]
fn test_invalid_transitions_are_rejected() {
    let mut net = new_manager(test_config());

    assert!(matches!(net.stop_server(), Err(NetError::ServerNotRunning)));
    assert!(net.start_client("not an address").is_err());

    net.start_server("127.0.0.1").unwrap();
    let addr = net.server_addr().unwrap().to_string();
    net.start_client(&addr).unwrap();
    assert!(matches!(
        net.start_client(&addr),
        Err(NetError::ClientAlreadyActive)
    ));
    assert!(matches!(net.stop_client(), Err(NetError::ClientNotConnected)));
}
