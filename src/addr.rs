//! Address families, name resolution, and bind-address selection.
//!
//! Resolution goes through `getaddrinfo` rather than the std trait so the
//! socket's address family can be passed as a hint and the canonical name
//! comes back for logging. Bind addresses for servers accept an
//! any-address sentinel, an IP literal, or an interface name looked up
//! with `getifaddrs`.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use log::debug;

use crate::error::{Error, Result};
use crate::sys;


//------------ Domain --------------------------------------------------------

/// The address family of a socket.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Domain {
    V4,
    V6,
}

impl Domain {
    pub(crate) fn family(self) -> libc::c_int {
        match self {
            Domain::V4 => libc::AF_INET,
            Domain::V6 => libc::AF_INET6,
        }
    }

    /// The any-address of this family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Domain::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Domain::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn of_addr(addr: &IpAddr) -> Domain {
        match addr {
            IpAddr::V4(_) => Domain::V4,
            IpAddr::V6(_) => Domain::V6,
        }
    }
}


//------------ Resolution -----------------------------------------------------

/// The outcome of a name lookup.
pub struct Resolved {
    /// The canonical name of the host, when the resolver reported one.
    pub canonical: Option<String>,

    /// Usable addresses in resolver preference order.
    pub addrs: Vec<SocketAddr>,
}

/// Resolves `host`/`service` into stream-socket addresses of `domain`.
pub fn resolve(host: &str, service: &str, domain: Domain) -> Result<Resolved> {
    lookup(host, service, Some(domain))
}

/// Guesses the address family for a host.
///
/// Tries numeric-address parsing first, then a canonical-name lookup, and
/// falls back to `default` when neither yields an answer.
pub fn domain_of(host: &str, service: &str, default: Domain) -> Domain {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Domain::of_addr(&addr);
    }
    match lookup(host, service, None) {
        Ok(resolved) => match resolved.addrs.first() {
            Some(addr) => Domain::of_addr(&addr.ip()),
            None => default,
        },
        Err(_) => default,
    }
}

fn lookup(host: &str, service: &str, domain: Option<Domain>) -> Result<Resolved> {
    let fail = |reason: String| Error::ResolveFailed {
        host: host.into(),
        service: service.into(),
        reason,
    };

    let c_host = CString::new(host).map_err(|_| fail("embedded nul".into()))?;
    let c_service = CString::new(service).map_err(|_| fail("embedded nul".into()))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = domain.map(Domain::family).unwrap_or(libc::AF_UNSPEC);
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_CANONNAME;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(c_host.as_ptr(), c_service.as_ptr(), &hints, &mut list)
    };
    if rc != 0 {
        let reason = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
            .to_string_lossy()
            .into_owned();
        return Err(fail(reason));
    }

    let mut canonical = None;
    let mut addrs = Vec::new();
    let mut cur = list;
    while !cur.is_null() {
        let info = unsafe { &*cur };
        if canonical.is_none() && !info.ai_canonname.is_null() {
            canonical = Some(
                unsafe { CStr::from_ptr(info.ai_canonname) }
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        if let Some(addr) = unsafe { sockaddr_from_ptr(info.ai_addr, info.ai_addrlen) } {
            addrs.push(addr);
        }
        cur = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(list) };

    if addrs.is_empty() {
        return Err(fail("no usable addresses".into()));
    }
    debug!(
        "resolved {}:{} to {} address(es)",
        host,
        service,
        addrs.len()
    );
    Ok(Resolved { canonical, addrs })
}


//------------ Bind-address selection -----------------------------------------

/// Selects the address a server binds to.
///
/// `spec` is the any-address sentinel (`""`, `"*"`, or `"any"`), an IP
/// literal of the server's family, or an interface name whose first
/// address in the family is taken. An interface lookup that produces no
/// usable address is an error; the server never silently binds the
/// any-address in that case.
pub fn bind_addr(spec: &str, domain: Domain, port: u16) -> Result<SocketAddr> {
    if spec.is_empty() || spec == "*" || spec.eq_ignore_ascii_case("any") {
        return Ok(SocketAddr::new(domain.unspecified(), port));
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        if Domain::of_addr(&ip) != domain {
            return Err(Error::InvalidArgument(
                "bind address family does not match the server domain",
            ));
        }
        return Ok(SocketAddr::new(ip, port));
    }
    match interface_addr(spec, domain)? {
        Some(ip) => Ok(SocketAddr::new(ip, port)),
        None => Err(Error::ResolveFailed {
            host: spec.into(),
            service: port.to_string(),
            reason: "no interface address in the server domain".into(),
        }),
    }
}

/// Finds the first address of `domain` on the named interface.
fn interface_addr(name: &str, domain: Domain) -> Result<Option<IpAddr>> {
    let mut list: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut list) } == -1 {
        return Err(Error::IoSyscall(io::Error::last_os_error()));
    }

    let mut found = None;
    let mut cur = list;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        let if_name = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if if_name.to_str() != Ok(name) {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        if family != domain.family() {
            continue;
        }
        let len = match domain {
            Domain::V4 => mem::size_of::<libc::sockaddr_in>(),
            Domain::V6 => mem::size_of::<libc::sockaddr_in6>(),
        } as libc::socklen_t;
        if let Some(addr) = unsafe { sockaddr_from_ptr(ifa.ifa_addr, len) } {
            found = Some(addr.ip());
            break;
        }
    }
    unsafe { libc::freeifaddrs(list) };
    Ok(found)
}

/// Copies a raw sockaddr into storage and decodes it.
unsafe fn sockaddr_from_ptr(
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    if addr.is_null() || len as usize > mem::size_of::<libc::sockaddr_storage>() {
        return None;
    }
    let mut storage: libc::sockaddr_storage = mem::zeroed();
    ptr::copy_nonoverlapping(
        addr as *const u8,
        &mut storage as *mut _ as *mut u8,
        len as usize,
    );
    sys::from_sockaddr(&storage)
}


//------------ Tests ----------------------------------------------------------
