//! End-to-end scenarios against the built-in echo session, no TLS.

use std::time::{Duration, Instant};

use netreactor::{
    Client, ClientHandler, DataSocket, Domain, EchoServer, Reactor, Server, SocketState,
};

#[derive(Default)]
struct Collector {
    received: Vec<u8>,
    connected: bool,
    disconnected: bool,
}

impl ClientHandler for Collector {
    fn connected(&mut self, _sock: &mut DataSocket) {
        self.connected = true;
    }

    fn data_available(&mut self, sock: &mut DataSocket) {
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf);
            if n == 0 {
                break;
            }
            self.received.extend_from_slice(&buf[..n]);
        }
    }

    fn disconnected(&mut self) {
        self.disconnected = true;
    }
}

/// Polls the reactor until `done` holds or `deadline` passes.
fn pump_until(reactor: &Reactor, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        reactor.poll(Some(Duration::from_millis(100))).unwrap();
        if done() {
            return true;
        }
    }
    false
}

fn echo_setup(reactor: &Reactor) -> (Server<EchoServer>, Client<Collector>) {
    let server = Server::new(reactor, None, Domain::V4, EchoServer);
    server.start(0, "127.0.0.1", false, 0).unwrap();
    assert!(server.listening());
    let port = server.local_addr().unwrap().port();

    let client = Client::new(reactor, Domain::V4, false, Collector::default()).unwrap();
    client.connect("127.0.0.1", &port.to_string()).unwrap();
    (server, client)
}

#[test]
fn s1_hello_round_trip() {
    let reactor = Reactor::new().unwrap();
    let (server, client) = echo_setup(&reactor);

    assert_eq!(client.write(b"hello\n"), 6);
    for _ in 0..10 {
        reactor.poll(Some(Duration::from_millis(100))).unwrap();
        if client.with_handler(|h| h.received.len()) == 6 {
            break;
        }
    }
    client.with_handler(|h| {
        assert!(h.connected);
        assert_eq!(h.received, b"hello\n");
    });

    // One listener, one client, one session; each registered exactly
    // once.
    assert_eq!(server.session_count(), 1);
    assert_eq!(reactor.socket_count(), 3);
}

#[test]
fn s2_ten_thousand_bytes_in_order() {
    let reactor = Reactor::new().unwrap();
    let (_server, client) = echo_setup(&reactor);

    let payload = vec![b'A'; 10_000];
    assert_eq!(client.write(&payload), payload.len());

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        client.with_handler(|h| h.received.len()) >= payload.len()
    }));
    client.with_handler(|h| assert_eq!(h.received, payload));
}

#[test]
fn sixty_four_kib_pattern_survives() {
    let reactor = Reactor::new().unwrap();
    let (_server, client) = echo_setup(&reactor);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i * 31 + 7) as u8).collect();
    assert_eq!(client.write(&payload), payload.len());

    assert!(pump_until(&reactor, Duration::from_secs(10), || {
        client.with_handler(|h| h.received.len()) >= payload.len()
    }));
    client.with_handler(|h| assert_eq!(h.received, payload));
}

#[test]
fn s5_stop_disconnects_everything() {
    let reactor = Reactor::new().unwrap();
    let (server, client) = echo_setup(&reactor);

    // Let the connection and session come up first.
    assert_eq!(client.write(b"x"), 1);
    assert!(pump_until(&reactor, Duration::from_secs(2), || {
        client.with_handler(|h| !h.received.is_empty())
    }));
    assert_eq!(server.session_count(), 1);

    server.stop();
    assert!(!server.listening());
    assert_eq!(server.session_count(), 0);

    // The client observes the close on the next polls.
    assert!(pump_until(&reactor, Duration::from_secs(2), || {
        client.state() == SocketState::Disconnected
    }));
    client.with_handler(|h| assert!(h.disconnected));

    // Nothing left to dispatch.
    assert_eq!(reactor.poll(Some(Duration::from_millis(50))).unwrap(), 0);
}

#[test]
fn s6_connect_to_unused_port() {
    let reactor = Reactor::new().unwrap();
    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();

    // Port 1 is essentially never listening. A non-blocking connect
    // reports in-progress first and fails on a later readiness event;
    // a synchronous refusal surfaces as an error straight away.
    match client.connect("127.0.0.1", "1") {
        Ok(()) => {
            assert_eq!(client.state(), SocketState::Connecting);
            assert!(pump_until(&reactor, Duration::from_secs(1), || {
                matches!(
                    client.state(),
                    SocketState::Unconnected | SocketState::Disconnected
                )
            }));
        }
        Err(_) => assert_eq!(client.state(), SocketState::Unconnected),
    }
    client.with_handler(|h| assert!(h.received.is_empty()));
}

#[test]
fn callback_write_echoes_back_again() {
    // A handler that re-enters write from inside data_available; the
    // nested interest update must hold up.
    struct Pinger {
        rounds: usize,
    }

    impl ClientHandler for Pinger {
        fn connected(&mut self, sock: &mut DataSocket) {
            sock.write(b"ping");
        }

        fn data_available(&mut self, sock: &mut DataSocket) {
            let mut buf = [0u8; 64];
            loop {
                let n = sock.read(&mut buf);
                if n == 0 {
                    break;
                }
            }
            self.rounds += 1;
            if self.rounds < 3 {
                sock.write(b"ping");
            }
        }
    }

    let reactor = Reactor::new().unwrap();
    let server = Server::new(&reactor, None, Domain::V4, EchoServer);
    server.start(0, "127.0.0.1", false, 0).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&reactor, Domain::V4, false, Pinger { rounds: 0 }).unwrap();
    client.connect("127.0.0.1", &port.to_string()).unwrap();

    assert!(pump_until(&reactor, Duration::from_secs(2), || {
        client.with_handler(|h| h.rounds >= 3)
    }));
}
