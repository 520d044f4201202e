//! The readiness reactor.
//!
//! A [`Reactor`] owns the OS readiness object and a registry mapping
//! descriptors to the sockets interested in them. Sockets register on
//! construction and deregister when they drop; in between, every call to
//! [`Reactor::poll`] waits for readiness and dispatches each delivered
//! event mask to its socket's [`EventSink::handle_events`].
//!
//! Dispatch is synchronous and single-threaded: the reactor is a cheap
//! clonable handle around `Rc` state, so it stays on the thread that
//! created it, and a handler always runs to completion before the next
//! one starts. Run one reactor per thread to use more cores.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};

/// How many descriptors one `poll` call dispatches at most.
///
/// Readiness beyond this is observed on the next call; the OS keeps the
/// rest of the ready list.
pub const MAX_EVENTS: usize = 10;


//------------ Ready ---------------------------------------------------------

/// A set of readiness conditions.
///
/// Used both as the interest mask a socket registers with and as the
/// event mask the reactor delivers.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b001);
    pub const WRITABLE: Ready = Ready(0b010);
    pub const PEER_CLOSED: Ready = Ready(0b100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    pub fn is_peer_closed(self) -> bool {
        self.contains(Ready::PEER_CLOSED)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"readable");
        }
        if self.is_writable() {
            set.entry(&"writable");
        }
        if self.is_peer_closed() {
            set.entry(&"peer-closed");
        }
        set.finish()
    }
}


//------------ EventSink ------------------------------------------------------

/// The event-dispatch entry point of a registered socket.
pub trait EventSink {
    /// Handles one delivered readiness mask.
    fn handle_events(&mut self, events: Ready);
}


//------------ Reactor --------------------------------------------------------

struct Entry {
    sink: Weak<RefCell<dyn EventSink>>,
    interest: Ready,
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    sockets: RefCell<HashMap<RawFd, Entry>>,
}

/// The event demultiplexer.
///
/// Cloning produces another handle to the same reactor. The reactor must
/// outlive every socket registered with it, which the socket types ensure
/// by each holding a handle.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Allocates the OS readiness object.
    pub fn new() -> Result<Reactor> {
        let poll = Poll::new().map_err(Error::IoInit)?;
        Ok(Reactor {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(MAX_EVENTS)),
                sockets: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Records `sink` under `fd` and registers the descriptor with the
    /// readiness object.
    pub fn add(
        &self,
        fd: RawFd,
        interest: Ready,
        sink: Weak<RefCell<dyn EventSink>>,
    ) -> Result<()> {
        let mut sockets = self.inner.sockets.borrow_mut();
        if sockets.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        self.inner
            .poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))
            .map_err(Error::IoRegister)?;
        sockets.insert(fd, Entry { sink, interest });
        trace!("registered fd {} with {:?}", fd, interest);
        Ok(())
    }

    /// Changes the interest mask for `fd`. A no-op when the mask is
    /// unchanged.
    pub fn update(&self, fd: RawFd, interest: Ready) -> Result<()> {
        let mut sockets = self.inner.sockets.borrow_mut();
        let entry = sockets.get_mut(&fd).ok_or(Error::NotRegistered(fd))?;
        if entry.interest == interest {
            return Ok(());
        }
        self.inner
            .poll
            .borrow()
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))
            .map_err(Error::IoRegister)?;
        entry.interest = interest;
        Ok(())
    }

    /// Deregisters `fd`. Removing a descriptor that is not registered is
    /// a quiet success.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let removed = self.inner.sockets.borrow_mut().remove(&fd);
        if removed.is_some() {
            // The descriptor may already be closed; nothing useful to do
            // with a failure here beyond noting it.
            if let Err(err) = self
                .inner
                .poll
                .borrow()
                .registry()
                .deregister(&mut SourceFd(&fd))
            {
                debug!("deregistering fd {} failed: {}", fd, err);
            }
            trace!("deregistered fd {}", fd);
        }
        Ok(())
    }

    /// Re-submits the current interest for `fd`.
    ///
    /// Under edge-triggered delivery this re-arms the descriptor: if a
    /// condition is still pending, the OS reports it again on the next
    /// poll. The listener uses this to take one accept per dispatch
    /// without losing queued connections.
    pub fn rearm(&self, fd: RawFd) -> Result<()> {
        let sockets = self.inner.sockets.borrow();
        let entry = sockets.get(&fd).ok_or(Error::NotRegistered(fd))?;
        self.inner
            .poll
            .borrow()
            .registry()
            .reregister(
                &mut SourceFd(&fd),
                Token(fd as usize),
                mio_interest(entry.interest),
            )
            .map_err(Error::IoRegister)
    }

    /// Whether the reactor currently holds a registration for `fd`.
    pub fn registered(&self, fd: RawFd) -> bool {
        self.inner.sockets.borrow().contains_key(&fd)
    }

    /// The interest mask currently recorded for `fd`.
    pub fn interest_of(&self, fd: RawFd) -> Option<Ready> {
        self.inner.sockets.borrow().get(&fd).map(|e| e.interest)
    }

    /// The number of registered descriptors.
    pub fn socket_count(&self) -> usize {
        self.inner.sockets.borrow().len()
    }

    /// Waits up to `timeout` for readiness and dispatches it.
    ///
    /// Returns the number of descriptors dispatched. A signal interrupting
    /// the wait returns `Ok(0)`. `None` waits indefinitely.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        let ready: Vec<(RawFd, Ready)> = {
            let mut events = self.inner.events.borrow_mut();
            let mut poll = self.inner.poll.borrow_mut();
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(Error::IoSyscall(err));
            }
            events
                .iter()
                .map(|event| {
                    let fd = event.token().0 as RawFd;
                    let mut mask = Ready::EMPTY;
                    if event.is_readable() {
                        mask |= Ready::READABLE;
                    }
                    if event.is_writable() {
                        mask |= Ready::WRITABLE;
                    }
                    if event.is_read_closed() || event.is_error() {
                        mask |= Ready::PEER_CLOSED;
                    }
                    (fd, mask)
                })
                .collect()
        };

        let mut dispatched = 0;
        for (fd, mask) in ready {
            // Look the socket up per event: an earlier handler in this
            // batch may have torn it down.
            let sink = {
                let sockets = self.inner.sockets.borrow();
                sockets.get(&fd).and_then(|entry| entry.sink.upgrade())
            };
            match sink {
                Some(sink) => {
                    trace!("dispatching {:?} to fd {}", mask, fd);
                    sink.borrow_mut().handle_events(mask);
                    dispatched += 1;
                }
                None => debug!("event for fd {} dropped, no longer registered", fd),
            }
        }
        Ok(dispatched)
    }
}

/// Translates an interest mask into the poller encoding.
///
/// Readable interest stays armed for every registration: peer-close and
/// connect completion ride on it, and under edge-triggered delivery a
/// socket whose state ignores the bit sees at most one spurious wakeup.
fn mio_interest(ready: Ready) -> Interest {
    if ready.contains(Ready::WRITABLE) {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}


//------------ Tests ----------------------------------------------------------
