//! Buffered stream sockets.
//!
//! [`DataSocket`] turns readiness into byte I/O: a readable event fills
//! the input buffer from the kernel (or the TLS engine), a writable event
//! drains the output buffer into it. User code only ever touches the
//! buffers — [`read`](DataSocket::read) never calls the network, and
//! [`write`](DataSocket::write) only appends and arms writable interest.
//!
//! The writable bit is in the interest mask exactly when the output
//! buffer is non-empty, so an idle socket causes no wakeups.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use log::{debug, trace};

use crate::reactor::Ready;
use crate::socket::{SocketCore, SocketState};
use crate::sys;
use crate::tls::TlsSession;

/// Size of the stack buffer one raw read fills.
const READ_CHUNK: usize = 256;


//------------ FillOutcome ----------------------------------------------------

/// What one input-buffer fill observed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FillOutcome {
    /// Bytes appended to the input buffer.
    pub bytes: usize,
    /// The connection is gone: orderly shutdown or a read error.
    pub closed: bool,
}


//------------ DataSocket -----------------------------------------------------

/// A stream socket with application-level input and output buffers and an
/// optional TLS engine.
pub struct DataSocket {
    core: SocketCore,
    inbuf: BytesMut,
    outbuf: BytesMut,
    tls: Option<TlsSession>,
}

impl DataSocket {
    pub(crate) fn new(core: SocketCore) -> DataSocket {
        DataSocket {
            core,
            inbuf: BytesMut::new(),
            outbuf: BytesMut::new(),
            tls: None,
        }
    }

    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut SocketCore {
        &mut self.core
    }

    /// The lifecycle state of the underlying socket.
    pub fn state(&self) -> SocketState {
        self.core.state()
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sys::local_addr(self.core.fd())
    }

    /// The peer address of a connected socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sys::peer_addr(self.core.fd())
    }

    /// Disables (or re-enables) Nagle's algorithm.
    pub fn set_no_delay(&mut self, enabled: bool) -> io::Result<()> {
        sys::set_no_delay(self.core.fd(), enabled)
    }

    /// Bytes waiting in the input buffer.
    pub fn available(&self) -> usize {
        self.inbuf.len()
    }

    /// Drains up to `dst.len()` bytes from the input buffer.
    ///
    /// Never touches the network; the readiness loop does all reading.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.inbuf.len());
        dst[..n].copy_from_slice(&self.inbuf[..n]);
        self.inbuf.advance(n);
        n
    }

    /// Appends `src` to the output buffer and arms writable interest.
    ///
    /// Returns the number of bytes accepted: all of them, or 0 on a
    /// disconnected socket.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if self.core.state() == SocketState::Disconnected {
            return 0;
        }
        self.outbuf.extend_from_slice(src);
        self.sync_writable_interest();
        src.len()
    }

    pub(crate) fn attach_tls(&mut self, session: TlsSession) {
        self.tls = Some(session);
    }

    pub(crate) fn tls(&self) -> Option<&TlsSession> {
        self.tls.as_ref()
    }

    pub(crate) fn tls_mut(&mut self) -> Option<&mut TlsSession> {
        self.tls.as_mut()
    }

    fn tls_handshaking(&self) -> bool {
        self.tls.as_ref().map_or(false, TlsSession::handshaking)
    }

    /// Reads everything currently deliverable into the input buffer.
    pub(crate) fn fill_input(&mut self) -> FillOutcome {
        let mut chunk = [0u8; READ_CHUNK];
        let mut outcome = FillOutcome {
            bytes: 0,
            closed: false,
        };
        loop {
            let res = match self.tls.as_mut() {
                Some(tls) => tls.read(&mut chunk),
                None => sys::recv(self.core.fd(), &mut chunk),
            };
            match res {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    outcome.bytes += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("read on fd {} failed: {}", self.core.fd(), err);
                    outcome.closed = true;
                    break;
                }
            }
        }
        if outcome.bytes > 0 {
            trace!("fd {}: buffered {} bytes in", self.core.fd(), outcome.bytes);
        }
        outcome
    }

    /// Attempts one maximal write of the buffered output.
    ///
    /// A short write keeps the untransmitted suffix at the head of the
    /// buffer. Returns `false` when the connection failed.
    ///
    /// No output leaves while a TLS handshake is in progress; the bytes
    /// stay buffered until the session is ready.
    pub(crate) fn drain_output(&mut self) -> bool {
        if self.outbuf.is_empty() || self.tls_handshaking() {
            self.sync_writable_interest();
            return true;
        }
        let len = self.outbuf.len();
        let res = match self.tls.as_mut() {
            Some(tls) => tls.write(&self.outbuf[..len]),
            None => sys::send(self.core.fd(), &self.outbuf[..len]),
        };
        let healthy = match res {
            Ok(n) => {
                trace!("fd {}: wrote {} of {} bytes", self.core.fd(), n, len);
                self.outbuf.advance(n);
                true
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => {
                debug!("write on fd {} failed: {}", self.core.fd(), err);
                false
            }
        };
        self.sync_writable_interest();
        healthy
    }

    /// Re-derives the interest mask from the output buffer.
    pub(crate) fn sync_writable_interest(&mut self) {
        if self.core.state() != SocketState::Connected || self.tls_handshaking() {
            return;
        }
        let mut want = Ready::READABLE | Ready::PEER_CLOSED;
        if !self.outbuf.is_empty() {
            want |= Ready::WRITABLE;
        }
        if let Err(err) = self.core.set_interest(want) {
            debug!("updating interest for fd {} failed: {}", self.core.fd(), err);
        }
    }

    /// Graceful shutdown: TLS close-notify first, then the socket.
    pub(crate) fn disconnect(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.shutdown();
        }
        self.tls = None;
        self.core.disconnect();
    }

    /// Forced teardown. Unsent output is discarded.
    pub(crate) fn disconnected(&mut self) {
        self.tls = None;
        self.outbuf.clear();
        self.core.disconnected();
    }
}


//------------ Tests ----------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Domain;
    use crate::reactor::Reactor;
    use std::os::fd::RawFd;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    fn data_socket(reactor: &Reactor, fd: RawFd) -> DataSocket {
        let mut core =
            SocketCore::new(reactor, Domain::V4, Some(fd), false, Ready::READABLE).unwrap();
        core.set_state(SocketState::Connected);
        DataSocket::new(core)
    }

    #[test]
    fn read_drains_in_order() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let mut sock = data_socket(&reactor, b);

        assert_eq!(sys::send(a, b"abcdef").unwrap(), 6);
        let outcome = sock.fill_input();
        assert_eq!(outcome.bytes, 6);
        assert!(!outcome.closed);
        assert_eq!(sock.available(), 6);

        let mut buf = [0u8; 4];
        assert_eq!(sock.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(sock.available(), 2);
        let mut rest = [0u8; 8];
        assert_eq!(sock.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"ef");

        sys::close(a);
    }

    #[test]
    fn fill_sees_orderly_shutdown() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let mut sock = data_socket(&reactor, b);

        assert_eq!(sys::send(a, b"tail").unwrap(), 4);
        sys::close(a);
        let outcome = sock.fill_input();
        assert_eq!(outcome.bytes, 4);
        assert!(outcome.closed);
        assert_eq!(sock.available(), 4);
    }

    #[test]
    fn writable_interest_follows_output_buffer() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let mut sock = data_socket(&reactor, b);

        assert_eq!(sock.write(b"payload"), 7);
        assert!(sock.core().interest().is_writable());

        assert!(sock.drain_output());
        assert!(!sock.core().interest().is_writable());

        let mut echo = [0u8; 16];
        assert_eq!(sys::recv(a, &mut echo).unwrap(), 7);
        assert_eq!(&echo[..7], b"payload");

        sys::close(a);
    }

    #[test]
    fn write_after_disconnect_returns_zero() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let mut sock = data_socket(&reactor, b);

        sock.disconnected();
        assert_eq!(sock.write(b"late"), 0);
        assert_eq!(sock.state(), SocketState::Disconnected);

        sys::close(a);
    }

    #[test]
    fn short_write_keeps_suffix_ordered() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socketpair();
        let mut sock = data_socket(&reactor, b);

        // Shrink the send buffer so a large write is cut short.
        let size: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                b,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(sock.write(&payload), payload.len());

        let mut received = Vec::new();
        let mut scratch = [0u8; 8192];
        loop {
            while sock.core().interest().is_writable() {
                assert!(sock.drain_output());
                match sys::recv(a, &mut scratch) {
                    Ok(n) => received.extend_from_slice(&scratch[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => panic!("recv failed: {err}"),
                }
            }
            if received.len() == payload.len() {
                break;
            }
            match sys::recv(a, &mut scratch) {
                Ok(n) => received.extend_from_slice(&scratch[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("recv failed: {err}"),
            }
        }
        assert_eq!(received, payload);

        sys::close(a);
    }
}
