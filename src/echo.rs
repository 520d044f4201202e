//! The built-in echo session.
//!
//! Everything read from a connection is written straight back. The demo
//! programs serve it, and the integration tests use it as the loopback
//! fixture.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use log::debug;

use crate::data::DataSocket;
use crate::server::{ServerHandler, SessionHandler};


//------------ EchoSession ----------------------------------------------------

/// Echoes input back to the peer.
pub struct EchoSession;

impl SessionHandler for EchoSession {
    fn data_available(&mut self, sock: &mut DataSocket) {
        let mut buf = [0u8; 1024];
        loop {
            let n = sock.read(&mut buf);
            if n == 0 {
                break;
            }
            sock.write(&buf[..n]);
        }
    }
}


//------------ EchoServer -----------------------------------------------------

/// Creates an [`EchoSession`] for every accepted connection.
pub struct EchoServer;

impl ServerHandler for EchoServer {
    type Session = EchoSession;

    fn create_session(&mut self, fd: RawFd, peer: SocketAddr) -> EchoSession {
        debug!("echo session on descriptor {} for {}", fd, peer);
        EchoSession
    }
}
