//! The socket base.
//!
//! [`SocketCore`] owns one stream-socket descriptor together with the
//! bookkeeping every socket in this crate shares: address family,
//! blocking mode, the interest mask registered with the reactor, and the
//! lifecycle state. The buffered and role-specific layers compose around
//! it rather than inheriting from it; the reactor dispatches to whatever
//! [`EventSink`](crate::reactor::EventSink) the owning wrapper registers.
//!
//! Construction is two-phase: the constructor creates and configures the
//! descriptor, and the owning wrapper calls [`SocketCore::register`] as
//! soon as its shared handle exists. Every public constructor in this
//! crate does so before returning, so the unregistered state is never
//! observable.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Weak;

use log::{debug, warn};

use crate::addr::Domain;
use crate::error::{Error, Result};
use crate::reactor::{EventSink, Reactor, Ready};
use crate::sys;


//------------ SocketState ----------------------------------------------------

/// The lifecycle state of a socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketState {
    Unconnected,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}


//------------ SocketCore -----------------------------------------------------

/// One OS socket descriptor and its registration.
///
/// While the state is `Listening`, `Connecting`, or `Connected` the
/// descriptor is open and the reactor holds exactly one registration for
/// it. `Disconnected` means the descriptor is closed and deregistered.
pub struct SocketCore {
    reactor: Reactor,
    fd: RawFd, // zero when no descriptor is owned
    domain: Domain,
    blocking: bool,
    interest: Ready,
    state: SocketState,
    registered: bool,
}

impl SocketCore {
    /// Creates a socket core.
    ///
    /// When `fd` is `None` a fresh stream socket of `domain` is opened.
    /// The descriptor is switched to non-blocking mode unless `blocking`
    /// is requested. On any failure the descriptor is closed again if it
    /// was created here, leaving nothing to leak.
    pub fn new(
        reactor: &Reactor,
        domain: Domain,
        fd: Option<RawFd>,
        blocking: bool,
        interest: Ready,
    ) -> Result<SocketCore> {
        if let Some(fd) = fd {
            if fd < 0 {
                return Err(Error::InvalidArgument("supplied descriptor is negative"));
            }
        }
        let owned = fd.is_none();
        let fd = match fd {
            Some(fd) => fd,
            None => sys::socket_stream(domain.family()).map_err(Error::IoSyscall)?,
        };
        if !blocking {
            if let Err(err) = sys::set_nonblocking(fd, true) {
                if owned {
                    sys::close(fd);
                }
                return Err(Error::IoSyscall(err));
            }
        }
        Ok(SocketCore {
            reactor: reactor.clone(),
            fd,
            domain,
            blocking,
            interest,
            state: SocketState::Unconnected,
            registered: false,
        })
    }

    /// Registers with the reactor under the owned descriptor.
    pub(crate) fn register(&mut self, sink: Weak<RefCell<dyn EventSink>>) -> Result<()> {
        self.reactor.add(self.fd, self.interest, sink)?;
        self.registered = true;
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Updates the registered interest mask.
    pub fn set_interest(&mut self, interest: Ready) -> Result<()> {
        if self.registered {
            self.reactor.update(self.fd, interest)?;
        }
        self.interest = interest;
        Ok(())
    }

    /// Starts a graceful shutdown.
    ///
    /// A connected socket gets a half-close in both directions first;
    /// then the socket converges on [`disconnected`](Self::disconnected).
    pub fn disconnect(&mut self) {
        if self.state == SocketState::Connected {
            if let Err(err) = sys::shutdown_both(self.fd) {
                debug!("shutdown of fd {} failed: {}", self.fd, err);
            }
        }
        self.disconnected();
    }

    /// Tears the socket down. Idempotent.
    pub fn disconnected(&mut self) {
        if self.state == SocketState::Disconnected {
            return;
        }
        if self.registered {
            if let Err(err) = self.reactor.remove(self.fd) {
                warn!("deregistering fd {} failed: {}", self.fd, err);
            }
            self.registered = false;
        }
        if self.fd != 0 {
            sys::close(self.fd);
            self.fd = 0;
        }
        self.state = SocketState::Disconnected;
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        if self.registered {
            let _ = self.reactor.remove(self.fd);
        }
        if self.fd != 0 {
            sys::close(self.fd);
        }
    }
}


//------------ Tests ----------------------------------------------------------
