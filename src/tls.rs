//! TLS contexts and sessions using OpenSSL.
//!
//! A [`TlsContext`] carries the per-role configuration: certificate and
//! key material, CA locations, verification mode, protocol floor. It is
//! configured through its builder and frozen the first time a session is
//! created from it. A [`TlsSession`] is the per-connection engine: it is
//! attached to an already-created descriptor, drives the handshake under
//! non-blocking I/O, and translates *want-read*/*want-write* conditions
//! into `WouldBlock` so the buffered socket layer retries on the next
//! readiness cycle.
//!
//! The session never owns the descriptor; the socket layer does.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
    SslVerifyMode, SslVersion,
};
use openssl::x509::{X509, X509VerifyResult};

use crate::error::{Error, Result};
use crate::sys;


//------------ TlsRole --------------------------------------------------------

/// Which side of the handshake a context configures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlsRole {
    Client,
    Server,
}


//------------ TlsContext -----------------------------------------------------

/// Shared TLS configuration for one role.
///
/// Configuration calls are only valid before the first session is
/// created; afterwards the underlying OpenSSL context is frozen and
/// further configuration fails with [`Error::TlsConfig`]. Failed
/// configuration calls log the decoded OpenSSL reason and leave the
/// context usable.
pub struct TlsContext {
    role: TlsRole,
    builder: Option<SslContextBuilder>,
    ctx: Option<SslContext>,
    key_pass: Option<Vec<u8>>,
}

impl TlsContext {
    /// Builds a context for `role`.
    pub fn new(role: TlsRole) -> Result<TlsContext> {
        // Modern OpenSSL self-initializes; this keeps the one-time library
        // setup explicit and cheap for older builds.
        openssl::init();
        let method = match role {
            TlsRole::Client => SslMethod::tls_client(),
            TlsRole::Server => SslMethod::tls_server(),
        };
        let builder = SslContextBuilder::new(method).map_err(|err| {
            error!("allocating TLS context failed: {}", err);
            Error::IoInit(io::Error::new(io::ErrorKind::Other, err))
        })?;
        Ok(TlsContext {
            role,
            builder: Some(builder),
            ctx: None,
            key_pass: None,
        })
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    fn builder_mut(&mut self) -> Result<&mut SslContextBuilder> {
        self.builder.as_mut().ok_or_else(|| {
            Error::TlsConfig("context is frozen; configure it before creating sessions".into())
        })
    }

    /// Configures verification, compression, and the protocol floor.
    ///
    /// With `verify_peer` a server additionally requires a client
    /// certificate. `tls_only` refuses the legacy SSL protocol versions.
    pub fn set_options(
        &mut self,
        verify_peer: bool,
        allow_compression: bool,
        tls_only: bool,
    ) -> Result<()> {
        let role = self.role;
        let builder = self.builder_mut()?;
        let mode = if verify_peer {
            match role {
                TlsRole::Client => SslVerifyMode::PEER,
                TlsRole::Server => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            }
        } else {
            SslVerifyMode::NONE
        };
        builder.set_verify(mode);
        if !allow_compression {
            builder.set_options(SslOptions::NO_COMPRESSION);
        }
        if tls_only {
            builder
                .set_min_proto_version(Some(SslVersion::TLS1))
                .map_err(|err| {
                    error!("setting TLS protocol floor failed: {}", err);
                    Error::TlsConfig(err.to_string())
                })?;
        }
        Ok(())
    }

    /// Uses the given CA material, or the OS default locations when both
    /// are `None`.
    pub fn set_verify_paths(
        &mut self,
        ca_file: Option<&Path>,
        ca_path: Option<&Path>,
    ) -> Result<()> {
        let builder = self.builder_mut()?;
        if ca_file.is_none() && ca_path.is_none() {
            return builder.set_default_verify_paths().map_err(|err| {
                error!("loading default verify paths failed: {}", err);
                Error::TlsConfig(err.to_string())
            });
        }
        if let Some(file) = ca_file {
            builder.set_ca_file(file).map_err(|err| {
                error!("loading CA file {} failed: {}", file.display(), err);
                Error::TlsConfig(err.to_string())
            })?;
        }
        if let Some(dir) = ca_path {
            for cert in read_cert_dir(dir)? {
                builder
                    .cert_store_mut()
                    .add_cert(cert)
                    .map_err(|err| {
                        error!("adding CA from {} failed: {}", dir.display(), err);
                        Error::TlsConfig(err.to_string())
                    })?;
            }
        }
        Ok(())
    }

    /// Stores the passphrase used to decrypt the private key.
    ///
    /// Must be set before [`set_certificate_and_key`](Self::set_certificate_and_key)
    /// when the key file is encrypted.
    pub fn set_private_key_password(&mut self, pass: impl Into<Vec<u8>>) {
        self.key_pass = Some(pass.into());
    }

    /// Loads a PEM certificate chain and its matching PEM private key.
    ///
    /// Mismatched pairs are rejected.
    pub fn set_certificate_and_key(&mut self, cert_file: &Path, key_file: &Path) -> Result<()> {
        let key_bytes = fs::read(key_file).map_err(|err| {
            error!("reading key file {} failed: {}", key_file.display(), err);
            Error::TlsConfig(err.to_string())
        })?;
        let key = match &self.key_pass {
            Some(pass) => PKey::private_key_from_pem_passphrase(&key_bytes, pass),
            None => PKey::private_key_from_pem(&key_bytes),
        }
        .map_err(|err| {
            error!("decoding key file {} failed: {}", key_file.display(), err);
            Error::TlsConfig(err.to_string())
        })?;

        let builder = self.builder_mut()?;
        builder.set_certificate_chain_file(cert_file).map_err(|err| {
            error!(
                "loading certificate chain {} failed: {}",
                cert_file.display(),
                err
            );
            Error::TlsConfig(err.to_string())
        })?;
        builder.set_private_key(&key).map_err(|err| {
            error!("installing private key failed: {}", err);
            Error::TlsConfig(err.to_string())
        })?;
        builder.check_private_key().map_err(|err| {
            error!("certificate and key do not match: {}", err);
            Error::TlsConfig(err.to_string())
        })?;
        info!(
            "loaded certificate {} with key {}",
            cert_file.display(),
            key_file.display()
        );
        Ok(())
    }

    /// The frozen OpenSSL context, building it on first use.
    fn context(&mut self) -> Result<&SslContext> {
        if self.ctx.is_none() {
            // Freeze: from here on the configuration is shared by every
            // session cloned off this context.
            let builder = self
                .builder
                .take()
                .ok_or_else(|| Error::TlsConfig("context builder missing".into()))?;
            self.ctx = Some(builder.build());
        }
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::TlsConfig("context unavailable".into()))
    }

    /// Creates the per-connection session for `fd`.
    ///
    /// `sni_host` is sent in the client hello and `verify_override`
    /// replaces the context verification mode for this session only.
    pub fn session(
        &mut self,
        fd: RawFd,
        sni_host: Option<&str>,
        verify_override: Option<bool>,
    ) -> Result<TlsSession> {
        let role = self.role;
        let ctx = self.context()?;
        let mut ssl = Ssl::new(ctx).map_err(|err| {
            error!("allocating TLS session failed: {}", err);
            Error::TlsConfig(err.to_string())
        })?;
        match role {
            TlsRole::Client => ssl.set_connect_state(),
            TlsRole::Server => ssl.set_accept_state(),
        }
        if let Some(host) = sni_host {
            ssl.set_hostname(host).map_err(|err| {
                error!("setting SNI hostname {} failed: {}", host, err);
                Error::TlsConfig(err.to_string())
            })?;
        }
        if let Some(verify) = verify_override {
            let mode = if verify {
                match role {
                    TlsRole::Client => SslVerifyMode::PEER,
                    TlsRole::Server => {
                        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
                    }
                }
            } else {
                SslVerifyMode::NONE
            };
            ssl.set_verify(mode);
        }
        let stream = SslStream::new(ssl, FdIo { fd })
            .map_err(|err| Error::TlsConfig(err.to_string()))?;
        Ok(TlsSession {
            stream,
            phase: Phase::Handshaking,
            role,
        })
    }
}

/// Loads every certificate found in PEM files under `dir`.
fn read_cert_dir(dir: &Path) -> Result<Vec<X509>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        error!("reading CA directory {} failed: {}", dir.display(), err);
        Error::TlsConfig(err.to_string())
    })?;
    let mut certs = Vec::new();
    for entry in entries {
        let path: PathBuf = match entry {
            Ok(entry) => entry.path(),
            Err(_) => continue,
        };
        if path.extension() != Some(std::ffi::OsStr::new("pem")) {
            continue;
        }
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        match X509::stack_from_pem(&bytes) {
            Ok(stack) => certs.extend(stack),
            Err(err) => debug!("skipping {}: {}", path.display(), err),
        }
    }
    Ok(certs)
}


//------------ TlsSession -----------------------------------------------------

/// Progress of a handshake attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStatus {
    /// The handshake is complete.
    Done,
    /// The transport must deliver more input first.
    WantRead,
    /// The transport must accept more output first.
    WantWrite,
    /// The handshake failed terminally.
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Handshaking,
    Ready,
    Failed,
}

/// One TLS connection.
pub struct TlsSession {
    stream: SslStream<FdIo>,
    phase: Phase,
    role: TlsRole,
}

impl TlsSession {
    pub fn role(&self) -> TlsRole {
        self.role
    }

    /// Whether the handshake has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Whether the handshake is still in progress.
    pub fn handshaking(&self) -> bool {
        self.phase == Phase::Handshaking
    }

    /// Drives the handshake one step.
    ///
    /// Call again on the next matching readiness event for `WantRead`
    /// and `WantWrite`. `Failed` is terminal.
    pub fn handshake(&mut self) -> HandshakeStatus {
        match self.phase {
            Phase::Ready => return HandshakeStatus::Done,
            Phase::Failed => return HandshakeStatus::Failed,
            Phase::Handshaking => {}
        }
        match self.stream.do_handshake() {
            Ok(()) => {
                debug!(
                    "TLS handshake complete, version {}",
                    self.stream.ssl().version_str()
                );
                self.phase = Phase::Ready;
                HandshakeStatus::Done
            }
            Err(err) => match err.code() {
                ErrorCode::WANT_READ => HandshakeStatus::WantRead,
                ErrorCode::WANT_WRITE => HandshakeStatus::WantWrite,
                _ => {
                    error!("TLS handshake failed: {}", describe(&err));
                    self.phase = Phase::Failed;
                    HandshakeStatus::Failed
                }
            },
        }
    }

    /// Encrypted read.
    ///
    /// `Ok(0)` is the peer's close-notify. *Want-read*/*want-write*
    /// surface as `WouldBlock`, as does a read before the handshake
    /// finished.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.phase {
            Phase::Handshaking => {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            Phase::Failed => {
                return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
            }
            Phase::Ready => {}
        }
        match self.stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(err) => translate(err),
        }
    }

    /// Encrypted write. Same blocking semantics as [`read`](Self::read).
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.phase {
            Phase::Handshaking => {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            Phase::Failed => {
                return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
            }
            Phase::Ready => {}
        }
        match self.stream.ssl_write(buf) {
            Ok(n) => Ok(n),
            Err(err) => translate(err),
        }
    }

    /// Sends the TLS close-notify. Best effort.
    pub fn shutdown(&mut self) {
        if self.phase != Phase::Ready {
            return;
        }
        if let Err(err) = self.stream.shutdown() {
            match err.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {}
                _ => debug!("TLS shutdown: {}", describe(&err)),
            }
        }
    }

    /// Post-handshake peer checks.
    ///
    /// Confirms the library's verify result and, when `check_subject` is
    /// set, matches the peer certificate's subject common name against
    /// `host` with the wildcard comparator. Only the common name is
    /// compared; subject-alternative-name entries are not consulted.
    pub fn post_validate(&mut self, host: &str, check_subject: bool) -> Result<()> {
        let result = self.stream.ssl().verify_result();
        if result != X509VerifyResult::OK {
            return Err(Error::TlsVerify(format!(
                "certificate verification failed: {}",
                result.error_string()
            )));
        }
        if check_subject {
            let name = self.peer_common_name().ok_or_else(|| {
                Error::TlsVerify("peer certificate carries no subject common name".into())
            })?;
            if !wildcard_match(&name, host) {
                return Err(Error::TlsVerify(format!(
                    "peer subject {} does not match {}",
                    name, host
                )));
            }
            debug!("peer subject {} matches {}", name, host);
        }
        Ok(())
    }

    /// The subject common name of the peer certificate.
    pub fn peer_common_name(&self) -> Option<String> {
        let cert = self.stream.ssl().peer_certificate()?;
        let entry = cert.subject_name().entries_by_nid(Nid::COMMONNAME).next()?;
        entry.data().as_utf8().ok().map(|name| name.to_string())
    }

    /// The library's verification verdict for the peer certificate.
    pub fn verify_result(&self) -> X509VerifyResult {
        self.stream.ssl().verify_result()
    }
}

/// Maps an OpenSSL error to the io-level convention the socket layer
/// speaks: retryable conditions become `WouldBlock`, the peer's
/// close-notify becomes `Ok(0)`.
fn translate(err: openssl::ssl::Error) -> io::Result<usize> {
    match err.code() {
        ErrorCode::ZERO_RETURN => Ok(0),
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
        _ => match err.into_io_error() {
            Ok(io_err) => Err(io_err),
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, describe(&err))),
        },
    }
}

fn describe(err: &openssl::ssl::Error) -> String {
    match err.ssl_error() {
        Some(stack) => stack.to_string(),
        None => err.to_string(),
    }
}


//------------ FdIo -----------------------------------------------------------

/// Non-owning descriptor transport for the TLS engine.
///
/// Reads and writes go straight to the socket; `EAGAIN` comes back as
/// `WouldBlock`, which OpenSSL reports upward as *want-read* or
/// *want-write*.
struct FdIo {
    fd: RawFd,
}

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        sys::recv(self.fd, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        sys::send(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}


//------------ Wildcard matching ----------------------------------------------

/// Matches a certificate name pattern against a hostname.
///
/// `*` matches any run of characters within one label; `?` matches
/// exactly one character. Comparison is case-insensitive.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match_bytes(pattern.as_bytes(), name.as_bytes())
}

fn match_bytes(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some(b'*') => {
            match_bytes(&pattern[1..], name)
                || (!name.is_empty() && name[0] != b'.' && match_bytes(pattern, &name[1..]))
        }
        Some(b'?') => !name.is_empty() && match_bytes(&pattern[1..], &name[1..]),
        Some(&ch) => {
            !name.is_empty()
                && name[0].eq_ignore_ascii_case(&ch)
                && match_bytes(&pattern[1..], &name[1..])
        }
    }
}


//------------ Tests ----------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wildcard_single_label() {
        assert!(wildcard_match("*.example.com", "api.example.com"));
        assert!(!wildcard_match("*.example.com", "a.b.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
    }

    #[test]
    fn wildcard_question_mark() {
        assert!(wildcard_match("?.a", "x.a"));
        assert!(!wildcard_match("?.a", "xy.a"));
    }

    #[test]
    fn wildcard_exact_and_case() {
        assert!(wildcard_match("mail.example.com", "MAIL.example.com"));
        assert!(!wildcard_match("mail.example.com", "mail.example.org"));
    }

    #[test]
    fn wildcard_mixed() {
        assert!(wildcard_match("*-db?.example.com", "prod-db1.example.com"));
        assert!(!wildcard_match("*-db?.example.com", "prod-db12.example.com"));
    }

    #[test]
    fn context_freezes_after_first_session() {
        let mut ctx = TlsContext::new(TlsRole::Client).unwrap();
        ctx.set_options(false, false, true).unwrap();
        let fd = crate::sys::socket_stream(libc::AF_INET).unwrap();
        let _session = ctx.session(fd, None, None).unwrap();
        assert!(matches!(
            ctx.set_options(false, false, true),
            Err(Error::TlsConfig(_))
        ));
        crate::sys::close(fd);
    }
}
