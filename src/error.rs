//! Error and result.
//!
//! Everything fallible in this crate reports through the [`Error`] enum.
//! OS-level failures keep their `std::io::Error` as the source; TLS
//! failures carry the decoded OpenSSL reason string, since the error
//! stack itself is drained at the point of failure.

use std::io;
use std::os::fd::RawFd;

use openssl::error::ErrorStack;
use thiserror::Error;


//------------ Error --------------------------------------------------------

/// The error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocating the OS readiness object or the TLS library failed.
    #[error("readiness object initialization failed: {0}")]
    IoInit(#[source] io::Error),

    /// The OS rejected a readiness registration, update, or removal.
    #[error("readiness registration failed: {0}")]
    IoRegister(#[source] io::Error),

    /// A socket syscall (read, write, accept, bind, listen, connect)
    /// failed.
    #[error("socket operation failed: {0}")]
    IoSyscall(#[source] io::Error),

    /// Name resolution returned no usable result.
    #[error("could not resolve {host}:{service}: {reason}")]
    ResolveFailed {
        host: String,
        service: String,
        reason: String,
    },

    /// The reactor already holds a registration for this descriptor.
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// The reactor holds no registration for this descriptor.
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    /// The TLS handshake did not complete.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Encrypted read, write, or shutdown failed.
    #[error("TLS I/O failed: {0}")]
    TlsIo(String),

    /// A TLS context or session rejected its configuration.
    #[error("TLS configuration rejected: {0}")]
    TlsConfig(String),

    /// Peer certificate verification or subject-name matching failed.
    #[error("TLS peer verification failed: {0}")]
    TlsVerify(String),

    /// A caller-supplied argument violated a documented rule.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl From<ErrorStack> for Error {
    fn from(err: ErrorStack) -> Error {
        Error::TlsConfig(err.to_string())
    }
}


//------------ Result -------------------------------------------------------

pub type Result<T> = std::result::Result<T, Error>;
