//! Serves the built-in echo session.
//!
//! Listens on the port given as the first argument (default 7777) and
//! echoes whatever connected peers send.

use std::env;

use netreactor::{Domain, EchoServer, Reactor, Server};
use simplelog::{Config, LevelFilter, SimpleLogger};

fn main() {
    SimpleLogger::init(LevelFilter::Debug, Config::default()).unwrap();

    let port = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7777);

    let reactor = Reactor::new().expect("creating the reactor");
    let server = Server::new(&reactor, None, Domain::V4, EchoServer);
    server
        .start(port, "any", false, 0)
        .expect("starting the server");

    while server.listening() {
        reactor.poll(None).expect("polling");
    }
}
