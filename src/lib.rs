//! Readiness-driven TCP networking with buffered sockets and optional TLS.
//!
//! The crate is built around a small set of cooperating pieces:
//!
//! * a [`Reactor`] that owns the OS readiness object and dispatches
//!   event masks to registered sockets, one reactor per thread;
//! * buffered stream sockets ([`DataSocket`]) that turn readiness into
//!   input/output byte buffers, so user code only ever reads from and
//!   writes to memory;
//! * an optional TLS engine ([`TlsContext`]/[`TlsSession`]) interposed
//!   between the buffers and the wire;
//! * role types — [`Client`] for outbound connections, [`Server`] with
//!   its accepted [`Session`]s for inbound ones — extended through the
//!   [`ClientHandler`], [`SessionHandler`], and [`ServerHandler`] traits.
//!
//! A minimal embedding creates a reactor, a client or server bound to
//! it, and then drives everything by calling [`Reactor::poll`] in a
//! loop:
//!
//! ```no_run
//! use std::time::Duration;
//! use netreactor::{Domain, EchoServer, Reactor, Server};
//!
//! let reactor = Reactor::new().unwrap();
//! let server = Server::new(&reactor, None, Domain::V4, EchoServer);
//! server.start(7777, "any", false, 0).unwrap();
//! loop {
//!     reactor.poll(Some(Duration::from_millis(100))).unwrap();
//! }
//! ```

pub mod addr;
pub mod client;
pub mod data;
pub mod echo;
pub mod error;
pub mod reactor;
pub mod server;
pub mod socket;
mod sys;
pub mod tls;

pub use addr::{domain_of, Domain};
pub use client::{Client, ClientHandler};
pub use data::DataSocket;
pub use echo::{EchoServer, EchoSession};
pub use error::{Error, Result};
pub use reactor::{EventSink, Reactor, Ready, MAX_EVENTS};
pub use server::{Server, ServerHandler, Session, SessionHandler};
pub use socket::{SocketCore, SocketState};
pub use tls::{TlsContext, TlsRole, TlsSession};
