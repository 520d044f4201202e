//! TCP servers and their sessions.
//!
//! A [`Server`] owns a listening socket and a map from descriptor to
//! [`Session`]. Readiness on the listener accepts one connection per
//! dispatch and asks the user's [`ServerHandler`] to create the session
//! behavior; each session is a buffered socket of its own, registered
//! with the same reactor.
//!
//! Sessions are owned by the server's map. When one disconnects it
//! removes its own entry through a weak handle to the map; the clone the
//! dispatch stack holds keeps the value alive until the running callback
//! returns, so a session is never freed while its code is on the stack.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use log::{debug, info, warn};

use crate::addr::{self, Domain};
use crate::data::DataSocket;
use crate::error::{Error, Result};
use crate::reactor::{EventSink, Reactor, Ready};
use crate::socket::{SocketCore, SocketState};
use crate::sys;
use crate::tls::{HandshakeStatus, TlsContext, TlsSession};

/// Listen backlog used when the caller passes 0.
pub const DEFAULT_BACKLOG: i32 = 50;


//------------ SessionHandler -------------------------------------------------

/// User behavior for one accepted connection.
///
/// Callbacks run on the reactor thread; interact with the connection
/// through the `&mut DataSocket` argument only.
pub trait SessionHandler: 'static {
    /// The session was accepted and inserted into the server's map.
    ///
    /// With TLS the handshake has not finished yet; output written here
    /// stays buffered until it has.
    fn accepted(&mut self, _sock: &mut DataSocket, _peer: SocketAddr) {}

    /// The input buffer grew.
    fn data_available(&mut self, sock: &mut DataSocket);

    /// The connection is gone. The session leaves the server's map right
    /// after this returns.
    fn disconnected(&mut self) {}
}


//------------ ServerHandler --------------------------------------------------

/// The session factory a server is built around.
pub trait ServerHandler: 'static {
    type Session: SessionHandler;

    /// Creates the behavior for a connection just accepted on `fd`.
    fn create_session(&mut self, fd: RawFd, peer: SocketAddr) -> Self::Session;
}


//------------ Session --------------------------------------------------------

type SessionMap<S> = HashMap<RawFd, Rc<RefCell<Session<S>>>>;

/// One accepted connection.
pub struct Session<S: SessionHandler> {
    data: DataSocket,
    peer: SocketAddr,
    handler: S,
    /// Key under which the server's map holds this session. The
    /// descriptor itself is zeroed on teardown, so the key is kept
    /// separately.
    key: RawFd,
    map: Weak<RefCell<SessionMap<S>>>,
}

impl<S: SessionHandler> Session<S> {
    /// The peer address the connection was accepted from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SocketState {
        self.data.state()
    }

    /// Bytes waiting in the input buffer.
    pub fn available(&self) -> usize {
        self.data.available()
    }

    /// Drains buffered input. See [`DataSocket::read`].
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.data.read(dst)
    }

    /// Buffers output for transmission. See [`DataSocket::write`].
    pub fn write(&mut self, src: &[u8]) -> usize {
        self.data.write(src)
    }

    /// Signals the start of the session; runs the server-side handshake
    /// when TLS is enabled.
    fn accepted(&mut self) {
        info!("connection from {} accepted", self.peer);
        let peer = self.peer;
        self.handler.accepted(&mut self.data, peer);
        if self.data.tls().is_some() {
            self.drive_handshake();
        }
    }

    fn drive_handshake(&mut self) -> bool {
        let status = match self.data.tls_mut() {
            Some(tls) => tls.handshake(),
            None => return true,
        };
        match status {
            HandshakeStatus::Done => {
                debug!("TLS session with {} established", self.peer);
                self.data.sync_writable_interest();
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
                warn!("TLS accept from {} failed", self.peer);
                self.disconnected();
                false
            }
        }
    }

    /// Graceful shutdown: close-notify first when TLS is attached.
    pub fn disconnect(&mut self) {
        if self.data.state() == SocketState::Connected {
            self.data.disconnect();
            self.finish_teardown();
        }
    }

    /// Forced teardown on peer close or error. Idempotent.
    fn disconnected(&mut self) {
        if self.data.state() != SocketState::Disconnected {
            self.data.disconnected();
            self.finish_teardown();
        }
    }

    /// Notifies the handler, then removes this session from the server's
    /// map. The map entry must go before anything else can see the
    /// session again; the dispatch stack's own clone keeps the value
    /// alive until the current callback returns.
    fn finish_teardown(&mut self) {
        info!("{} disconnected", self.peer);
        self.handler.disconnected();
        if let Some(map) = self.map.upgrade() {
            map.borrow_mut().remove(&self.key);
        }
    }
}

impl<S: SessionHandler> EventSink for Session<S> {
    fn handle_events(&mut self, events: Ready) {
        if self.data.state() != SocketState::Connected {
            return;
        }
        if events.is_peer_closed() {
            self.disconnected();
            return;
        }
        let mut fill = events.is_readable();
        if self.data.tls().map_or(false, TlsSession::handshaking) {
            if !self.drive_handshake() {
                return;
            }
            // Pick up records the engine decrypted while finishing.
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


//------------ Server ---------------------------------------------------------

struct ServerInner<H: ServerHandler> {
    reactor: Reactor,
    domain: Domain,
    core: Option<SocketCore>,
    tls: Option<TlsContext>,
    use_tls: bool,
    handler: H,
    sessions: Rc<RefCell<SessionMap<H::Session>>>,
}

/// A listening socket plus the sessions accepted from it.
pub struct Server<H: ServerHandler> {
    inner: Rc<RefCell<ServerInner<H>>>,
}

impl<H: ServerHandler> Server<H> {
    /// Creates a stopped server. `tls` supplies the server-role context
    /// used when `start` enables TLS.
    pub fn new(
        reactor: &Reactor,
        tls: Option<TlsContext>,
        domain: Domain,
        handler: H,
    ) -> Server<H> {
        Server {
            inner: Rc::new(RefCell::new(ServerInner {
                reactor: reactor.clone(),
                domain,
                core: None,
                tls,
                use_tls: false,
                handler,
                sessions: Rc::new(RefCell::new(HashMap::new())),
            })),
        }
    }

    /// Binds and starts listening.
    ///
    /// `bind_spec` is `""`/`"*"`/`"any"` for the any-address, an IP
    /// literal, or an interface name. A `backlog` of 0 selects
    /// [`DEFAULT_BACKLOG`]. Failures leave the server stopped.
    pub fn start(&self, port: u16, bind_spec: &str, use_tls: bool, backlog: i32) -> Result<()> {
        let sink: Rc<RefCell<dyn EventSink>> = self.inner.clone();
        self.inner
            .borrow_mut()
            .start(port, bind_spec, use_tls, backlog, Rc::downgrade(&sink))
    }

    /// Disconnects every session and closes the listener.
    pub fn stop(&self) {
        self.inner.borrow_mut().stop();
    }

    /// Whether the listener is up.
    pub fn listening(&self) -> bool {
        self.inner
            .borrow()
            .core
            .as_ref()
            .map_or(false, |core| core.state() == SocketState::Listening)
    }

    /// The bound address of the listener; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner.borrow().core {
            Some(core) => sys::local_addr(core.fd()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not listening")),
        }
    }

    /// The number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.borrow().sessions.borrow().len()
    }

    /// Runs `f` over the server handler.
    pub fn with_handler<R>(&self, f: impl FnOnce(&H) -> R) -> R {
        f(&self.inner.borrow().handler)
    }

    /// Runs `f` over the server handler, mutably.
    pub fn with_handler_mut<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.inner.borrow_mut().handler)
    }
}

impl<H: ServerHandler> ServerInner<H> {
    fn start(
        &mut self,
        port: u16,
        bind_spec: &str,
        use_tls: bool,
        backlog: i32,
        sink: Weak<RefCell<dyn EventSink>>,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(Error::InvalidArgument("server is already started"));
        }
        if use_tls && self.tls.is_none() {
            return Err(Error::InvalidArgument(
                "TLS requested but no TLS context was supplied",
            ));
        }
        let bind = addr::bind_addr(bind_spec, self.domain, port)?;
        let backlog = if backlog > 0 { backlog } else { DEFAULT_BACKLOG };

        let mut core = SocketCore::new(&self.reactor, self.domain, None, false, Ready::READABLE)?;
        sys::set_reuse_addr(core.fd()).map_err(Error::IoSyscall)?;
        sys::bind(core.fd(), &bind).map_err(Error::IoSyscall)?;
        sys::listen(core.fd(), backlog).map_err(Error::IoSyscall)?;
        core.register(sink)?;
        core.set_state(SocketState::Listening);
        self.use_tls = use_tls;
        match sys::local_addr(core.fd()) {
            Ok(addr) => info!("server listening on {}", addr),
            Err(_) => info!("server listening on {}", bind),
        }
        self.core = Some(core);
        Ok(())
    }

    fn stop(&mut self) {
        let sessions: Vec<_> = self.sessions.borrow().values().cloned().collect();
        for session in sessions {
            session.borrow_mut().disconnect();
        }
        if let Some(mut core) = self.core.take() {
            core.disconnected();
        }
        info!("server stopped");
    }

    /// Accepts one pending connection and builds its session.
    fn accept_connection(&mut self) {
        let listen_fd = match &self.core {
            Some(core) => core.fd(),
            None => return,
        };
        let (fd, peer) = match sys::accept(listen_fd) {
            Ok(pair) => pair,
            Err(err) => {
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!("accept failed: {}", err);
                }
                return;
            }
        };

        // Defend against a stale entry under the same descriptor; it can
        // only mean its socket was closed behind our back.
        if let Some(stale) = self.sessions.borrow_mut().remove(&fd) {
            warn!(
                "a session for descriptor {} already exists, discarding it",
                fd
            );
            stale.borrow_mut().disconnected();
        }

        let core = match SocketCore::new(
            &self.reactor,
            self.domain,
            Some(fd),
            false,
            Ready::READABLE | Ready::PEER_CLOSED,
        ) {
            Ok(core) => core,
            Err(err) => {
                warn!("configuring accepted socket failed: {}", err);
                sys::close(fd);
                return;
            }
        };
        let mut data = DataSocket::new(core);
        data.core_mut().set_state(SocketState::Connected);

        if self.use_tls {
            let session = match &mut self.tls {
                Some(ctx) => ctx.session(fd, None, None),
                None => return,
            };
            match session {
                Ok(session) => data.attach_tls(session),
                Err(err) => {
                    warn!("TLS session for {} failed: {}", peer, err);
                    data.disconnected();
                    return;
                }
            }
        }

        let handler = self.handler.create_session(fd, peer);
        let session = Rc::new(RefCell::new(Session {
            data,
            peer,
            handler,
            key: fd,
            map: Rc::downgrade(&self.sessions),
        }));
        let sink: Rc<RefCell<dyn EventSink>> = session.clone();
        if let Err(err) = session
            .borrow_mut()
            .data
            .core_mut()
            .register(Rc::downgrade(&sink))
        {
            warn!("registering session for {} failed: {}", peer, err);
            session.borrow_mut().data.disconnected();
            return;
        }
        self.sessions.borrow_mut().insert(fd, session.clone());

        session.borrow_mut().accepted();
        if session.borrow().data.state() != SocketState::Connected {
            debug!("session from {} ended during accept", peer);
        }
    }
}

impl<H: ServerHandler> EventSink for ServerInner<H> {
    fn handle_events(&mut self, events: Ready) {
        let listening = self
            .core
            .as_ref()
            .map_or(false, |core| core.state() == SocketState::Listening);
        if listening && events.is_readable() {
            // One accept per dispatch; re-arming makes any still-queued
            // connection surface as the next readiness event.
            self.accept_connection();
            if let Some(core) = &self.core {
                let _ = self.reactor.rearm(core.fd());
            }
        }
    }
}
