//! Line-based echo client.
//!
//! Connects to the host and port given on the command line, forwards
//! stdin lines to the peer, and prints whatever comes back. Stdin is
//! read on its own thread and marshalled to the reactor thread through a
//! mutex-guarded string, since sockets must only be touched from the
//! thread that polls their reactor.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netreactor::{domain_of, Client, ClientHandler, DataSocket, Domain, Reactor, SocketState};
use simplelog::{Config, LevelFilter, SimpleLogger};

struct Printer;

impl ClientHandler for Printer {
    fn connected(&mut self, _sock: &mut DataSocket) {
        println!("connected");
    }

    fn data_available(&mut self, sock: &mut DataSocket) {
        let mut buf = [0u8; 1024];
        loop {
            let n = sock.read(&mut buf);
            if n == 0 {
                break;
            }
            print!("{}", String::from_utf8_lossy(&buf[..n]));
        }
        io::stdout().flush().ok();
    }

    fn disconnected(&mut self) {
        println!("disconnected");
    }
}

fn main() {
    SimpleLogger::init(LevelFilter::Info, Config::default()).unwrap();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".into());
    let service = args.next().unwrap_or_else(|| "7777".into());

    let reactor = Reactor::new().expect("creating the reactor");
    let domain = domain_of(&host, &service, Domain::V4);
    let client = Client::new(&reactor, domain, false, Printer).expect("creating the client");
    client.connect(&host, &service).expect("starting the connect");

    // Stdin reader thread hands lines over through a guarded string.
    let pending = Arc::new(Mutex::new(String::new()));
    {
        let pending = Arc::clone(&pending);
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let mut queued = pending.lock().unwrap();
                queued.push_str(&line);
                queued.push('\n');
            }
        });
    }

    while matches!(
        client.state(),
        SocketState::Connecting | SocketState::Connected
    ) {
        reactor
            .poll(Some(Duration::from_millis(100)))
            .expect("polling");
        let mut queued = pending.lock().unwrap();
        if !queued.is_empty() {
            client.write(queued.as_bytes());
            queued.clear();
        }
    }
}
