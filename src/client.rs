//! TCP clients.
//!
//! A [`Client`] is a buffered socket that initiates the connection:
//! resolve, start a non-blocking connect, finish on writable readiness,
//! and, when TLS is configured, run the client-side handshake before the
//! connection is reported usable. User behavior plugs in through
//! [`ClientHandler`].

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::addr::{self, Domain};
use crate::data::DataSocket;
use crate::error::{Error, Result};
use crate::reactor::{EventSink, Reactor, Ready};
use crate::socket::{SocketCore, SocketState};
use crate::sys;
use crate::tls::{HandshakeStatus, TlsContext, TlsRole, TlsSession};


//------------ ClientHandler --------------------------------------------------

/// User behavior for a client connection.
///
/// All callbacks run on the reactor thread with the connection's socket
/// borrowed mutably. Interact with the connection through the `&mut
/// DataSocket` argument; calling back into the owning [`Client`] wrapper
/// from inside a callback would re-enter its shared cell.
pub trait ClientHandler: 'static {
    /// The connection is usable: the TCP connect finished and, with TLS,
    /// the handshake completed.
    fn connected(&mut self, _sock: &mut DataSocket) {}

    /// The input buffer grew; read from it with
    /// [`DataSocket::read`].
    fn data_available(&mut self, sock: &mut DataSocket);

    /// The connection is gone: peer close, error, or a local
    /// `disconnect`.
    fn disconnected(&mut self) {}
}


//------------ Client ---------------------------------------------------------

#[derive(Default)]
struct TlsClientConfig {
    use_tls: bool,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    key_pass: Option<Vec<u8>>,
    ca_file: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    verify_peer: bool,
    check_subject_name: bool,
}

struct ClientInner<H: ClientHandler> {
    data: DataSocket,
    handler: H,
    cfg: TlsClientConfig,
    host: Option<String>,
}

/// A connection-initiating buffered socket.
///
/// Cheap to hand around: the value is a shared handle onto the state the
/// reactor dispatches into.
pub struct Client<H: ClientHandler> {
    inner: Rc<RefCell<ClientInner<H>>>,
}

impl<H: ClientHandler> Client<H> {
    /// Creates the socket and registers it with the reactor.
    pub fn new(reactor: &Reactor, domain: Domain, blocking: bool, handler: H) -> Result<Client<H>> {
        let core = SocketCore::new(
            reactor,
            domain,
            None,
            blocking,
            Ready::READABLE | Ready::PEER_CLOSED,
        )?;
        let inner = Rc::new(RefCell::new(ClientInner {
            data: DataSocket::new(core),
            handler,
            cfg: TlsClientConfig::default(),
            host: None,
        }));
        let sink: Rc<RefCell<dyn EventSink>> = inner.clone();
        inner
            .borrow_mut()
            .data
            .core_mut()
            .register(Rc::downgrade(&sink))?;
        Ok(Client { inner })
    }

    /// Enables TLS for the next `connect`.
    pub fn set_use_tls(&self, use_tls: bool) {
        self.inner.borrow_mut().cfg.use_tls = use_tls;
    }

    /// Supplies a client certificate chain and key. Enables TLS.
    pub fn set_certificate(&self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) {
        let mut inner = self.inner.borrow_mut();
        inner.cfg.cert_file = Some(cert_file.into());
        inner.cfg.key_file = Some(key_file.into());
        inner.cfg.use_tls = true;
    }

    /// Passphrase for an encrypted private key.
    pub fn set_key_password(&self, pass: impl Into<Vec<u8>>) {
        self.inner.borrow_mut().cfg.key_pass = Some(pass.into());
    }

    /// CA bundle file used to verify the server.
    pub fn set_ca_file(&self, path: impl Into<PathBuf>) {
        self.inner.borrow_mut().cfg.ca_file = Some(path.into());
    }

    /// Directory of PEM CA certificates used to verify the server.
    pub fn set_ca_path(&self, path: impl Into<PathBuf>) {
        self.inner.borrow_mut().cfg.ca_path = Some(path.into());
    }

    /// Requires the server certificate to verify against the CA material.
    pub fn set_verify_peer(&self, verify: bool) {
        self.inner.borrow_mut().cfg.verify_peer = verify;
    }

    /// Additionally matches the server certificate's subject common name
    /// against the connect hostname. Requires `verify_peer`.
    pub fn set_check_peer_subject_name(&self, check: bool) {
        self.inner.borrow_mut().cfg.check_subject_name = check;
    }

    /// Resolves `host`/`service` and starts connecting.
    ///
    /// Returns once the connect is underway (state `Connecting`) or, for
    /// a synchronous completion, established. A failure leaves the client
    /// `Unconnected`.
    pub fn connect(&self, host: &str, service: &str) -> Result<()> {
        self.inner.borrow_mut().connect(host, service)
    }

    /// Starts a graceful disconnect.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().disconnect();
    }

    pub fn state(&self) -> SocketState {
        self.inner.borrow().data.state()
    }

    /// Bytes waiting in the input buffer.
    pub fn available(&self) -> usize {
        self.inner.borrow().data.available()
    }

    /// Drains buffered input. See [`DataSocket::read`].
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.inner.borrow_mut().data.read(dst)
    }

    /// Buffers output for transmission. See [`DataSocket::write`].
    pub fn write(&self, src: &[u8]) -> usize {
        self.inner.borrow_mut().data.write(src)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().data.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().data.peer_addr()
    }

    /// Runs `f` over the handler.
    pub fn with_handler<R>(&self, f: impl FnOnce(&H) -> R) -> R {
        f(&self.inner.borrow().handler)
    }

    /// Runs `f` over the handler, mutably.
    pub fn with_handler_mut<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.inner.borrow_mut().handler)
    }
}

impl<H: ClientHandler> ClientInner<H> {
    fn connect(&mut self, host: &str, service: &str) -> Result<()> {
        if self.cfg.cert_file.is_some() != self.cfg.key_file.is_some() {
            return Err(Error::InvalidArgument(
                "certificate and key must be supplied together",
            ));
        }
        if self.cfg.check_subject_name && !self.cfg.verify_peer {
            return Err(Error::InvalidArgument(
                "check-peer-subject-name requires verify-peer",
            ));
        }

        let resolved = addr::resolve(host, service, self.data.core().domain())?;
        match &resolved.canonical {
            Some(name) => info!("connecting to {} ({}:{})", name, host, service),
            None => info!("connecting to {}:{}", host, service),
        }
        self.host = Some(host.into());

        // The session is created before the connect starts so its
        // descriptor is in place when readiness arrives.
        if self.cfg.use_tls {
            let session = self.build_tls_session(host)?;
            self.data.attach_tls(session);
        }

        let mut last_err = None;
        for addr in &resolved.addrs {
            match sys::connect(self.data.core().fd(), addr) {
                Ok(true) => {
                    self.establish();
                    return Ok(());
                }
                Ok(false) => {
                    self.data.core_mut().set_state(SocketState::Connecting);
                    self.data.core_mut().set_interest(
                        Ready::READABLE | Ready::WRITABLE | Ready::PEER_CLOSED,
                    )?;
                    return Ok(());
                }
                Err(err) => {
                    warn!("connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(Error::IoSyscall(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to")
        })))
    }

    fn build_tls_session(&mut self, host: &str) -> Result<TlsSession> {
        let mut ctx = TlsContext::new(TlsRole::Client)?;
        ctx.set_options(self.cfg.verify_peer, false, true)?;
        ctx.set_verify_paths(self.cfg.ca_file.as_deref(), self.cfg.ca_path.as_deref())?;
        if let Some(pass) = &self.cfg.key_pass {
            ctx.set_private_key_password(pass.clone());
        }
        if let (Some(cert), Some(key)) = (&self.cfg.cert_file, &self.cfg.key_file) {
            ctx.set_certificate_and_key(cert, key)?;
        }
        ctx.session(self.data.core().fd(), Some(host), None)
    }

    /// The TCP connect finished.
    fn establish(&mut self) {
        self.data.core_mut().set_state(SocketState::Connected);
        if self.data.tls().is_some() {
            debug!("connection up, starting TLS handshake");
            self.drive_handshake();
        } else {
            info!("connected");
            self.data.sync_writable_interest();
            self.handler.connected(&mut self.data);
        }
    }

    /// Advances the TLS handshake.
    ///
    /// Returns true when the session is ready and the connection is still
    /// up.
    fn drive_handshake(&mut self) -> bool {
        let status = match self.data.tls_mut() {
            Some(tls) => tls.handshake(),
            None => return true,
        };
        match status {
            HandshakeStatus::Done => {
                if self.cfg.verify_peer {
                    let host = self.host.clone().unwrap_or_default();
                    let check = self.cfg.check_subject_name;
                    let verdict = self
                        .data
                        .tls_mut()
                        .map(|tls| tls.post_validate(&host, check));
                    if let Some(Err(err)) = verdict {
                        warn!("{}", err);
                        self.disconnected();
                        return false;
                    }
                }
                info!("connected (TLS)");
                self.data.sync_writable_interest();
                self.handler.connected(&mut self.data);
                true
            }
            HandshakeStatus::WantRead => {
                let _ = self
                    .data
                    .core_mut()
                    .set_interest(Ready::READABLE | Ready::PEER_CLOSED);
                false
            }
            HandshakeStatus::WantWrite => {
                let _ = self.data.core_mut().set_interest(
                    Ready::READABLE | Ready::WRITABLE | Ready::PEER_CLOSED,
                );
                false
            }
            HandshakeStatus::Failed => {
                self.disconnected();
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if matches!(
            self.data.state(),
            SocketState::Connecting | SocketState::Connected
        ) {
            self.data.disconnect();
            info!("disconnected");
            self.handler.disconnected();
        }
    }

    fn disconnected(&mut self) {
        if matches!(
            self.data.state(),
            SocketState::Connecting | SocketState::Connected
        ) {
            self.data.disconnected();
            info!("disconnected");
            self.handler.disconnected();
        }
    }

    fn on_connecting_events(&mut self, events: Ready) {
        if events.is_peer_closed() {
            match sys::take_socket_error(self.data.core().fd()) {
                Ok(()) => warn!("connection refused or reset while connecting"),
                Err(err) => warn!("connect failed: {}", err),
            }
            // Left open for the caller to retry; just stop watching.
            self.data.core_mut().set_state(SocketState::Unconnected);
            let _ = self.data.core_mut().set_interest(Ready::EMPTY);
            return;
        }
        if events.is_writable() {
            match sys::take_socket_error(self.data.core().fd()) {
                Ok(()) => self.establish(),
                Err(err) => {
                    warn!("connect failed: {}", err);
                    self.data.core_mut().set_state(SocketState::Unconnected);
                    let _ = self.data.core_mut().set_interest(Ready::EMPTY);
                }
            }
        }
    }

    fn on_connected_events(&mut self, events: Ready) {
        if events.is_peer_closed() {
            self.disconnected();
            return;
        }
        let mut fill = events.is_readable();
        if self.data.tls().map_or(false, TlsSession::handshaking) {
            if !self.drive_handshake() {
                return;
            }
            // Records decrypted while the handshake finished may already
            // be buffered inside the engine; collect them now.
            fill = true;
        }
        if fill {
            let outcome = self.data.fill_input();
            if outcome.bytes > 0 {
                self.handler.data_available(&mut self.data);
            }
            if outcome.closed {
                self.disconnected();
                return;
            }
            self.data.sync_writable_interest();
        }
        if events.is_writable() && !self.data.drain_output() {
            self.disconnected();
        }
    }
}

impl<H: ClientHandler> EventSink for ClientInner<H> {
    fn handle_events(&mut self, events: Ready) {
        match self.data.state() {
            SocketState::Connected => self.on_connected_events(events),
            SocketState::Connecting => self.on_connecting_events(events),
            _ => debug!("ignoring {:?} in state {:?}", events, self.data.state()),
        }
    }
}
