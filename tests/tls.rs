//! End-to-end TLS scenarios with throwaway certificates.
//!
//! Certificates are generated at runtime: one CA signing the server
//! certificate, and a second, unrelated CA for the mismatch case.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509, X509Name};

use netreactor::{
    Client, ClientHandler, DataSocket, Domain, EchoServer, Error, Reactor, Server, SocketState,
    TlsContext, TlsRole,
};

#[derive(Default)]
struct Collector {
    received: Vec<u8>,
    connected: bool,
    disconnected: bool,
}

impl ClientHandler for Collector {
    fn connected(&mut self, _sock: &mut DataSocket) {
        self.connected = true;
    }

    fn data_available(&mut self, sock: &mut DataSocket) {
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf);
            if n == 0 {
                break;
            }
            self.received.extend_from_slice(&buf[..n]);
        }
    }

    fn disconnected(&mut self) {
        self.disconnected = true;
    }
}

fn pump_until(reactor: &Reactor, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        reactor.poll(Some(Duration::from_millis(100))).unwrap();
        if done() {
            return true;
        }
    }
    false
}


//------------ Certificate fixtures -------------------------------------------

fn name_with_cn(cn: &str) -> X509Name {
    let mut builder = X509Name::builder().unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn make_ca(cn: &str) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let name = name_with_cn(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn make_leaf(cn: &str, ca: &X509, ca_key: &PKey<Private>) -> (X509, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let name = name_with_cn(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(2).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

struct CertDir {
    ca_file: PathBuf,
    other_ca_file: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
}

/// Writes a CA, a server certificate it signs, and an unrelated CA into
/// a per-test temp directory.
fn write_certs(tag: &str, server_cn: &str) -> CertDir {
    let dir = std::env::temp_dir().join(format!("netreactor-tls-{}-{}", std::process::id(), tag));
    fs::create_dir_all(&dir).unwrap();

    let (ca, ca_key) = make_ca("netreactor test CA");
    let (other_ca, _) = make_ca("netreactor other CA");
    let (cert, key) = make_leaf(server_cn, &ca, &ca_key);

    let paths = CertDir {
        ca_file: dir.join("ca.pem"),
        other_ca_file: dir.join("other-ca.pem"),
        cert_file: dir.join("server.pem"),
        key_file: dir.join("server.key"),
    };
    fs::write(&paths.ca_file, ca.to_pem().unwrap()).unwrap();
    fs::write(&paths.other_ca_file, other_ca.to_pem().unwrap()).unwrap();
    fs::write(&paths.cert_file, cert.to_pem().unwrap()).unwrap();
    fs::write(&paths.key_file, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    paths
}

fn tls_echo_server(reactor: &Reactor, certs: &CertDir) -> Server<EchoServer> {
    let mut ctx = TlsContext::new(TlsRole::Server).unwrap();
    ctx.set_options(false, false, true).unwrap();
    ctx.set_certificate_and_key(&certs.cert_file, &certs.key_file)
        .unwrap();
    let server = Server::new(reactor, Some(ctx), Domain::V4, EchoServer);
    server.start(0, "127.0.0.1", true, 0).unwrap();
    assert!(server.listening());
    server
}


//------------ Scenarios ------------------------------------------------------

#[test]
fn s3_verified_round_trip() {
    let certs = write_certs("s3", "localhost");
    let reactor = Reactor::new().unwrap();
    let server = tls_echo_server(&reactor, &certs);
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    client.set_use_tls(true);
    client.set_ca_file(&certs.ca_file);
    client.set_verify_peer(true);
    client.connect("127.0.0.1", &port.to_string()).unwrap();
    client.write(b"ping");

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        client.with_handler(|h| h.received.len() >= 4)
    }));
    client.with_handler(|h| {
        assert!(h.connected);
        assert_eq!(h.received, b"ping");
    });
}

#[test]
fn s4_wrong_ca_disconnects_before_data() {
    let certs = write_certs("s4", "localhost");
    let reactor = Reactor::new().unwrap();
    let server = tls_echo_server(&reactor, &certs);
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    client.set_use_tls(true);
    client.set_ca_file(&certs.other_ca_file);
    client.set_verify_peer(true);
    client.connect("127.0.0.1", &port.to_string()).unwrap();
    client.write(b"ping");

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        client.state() == SocketState::Disconnected
    }));
    client.with_handler(|h| {
        assert!(!h.connected);
        assert!(h.disconnected);
        assert!(h.received.is_empty());
    });

    // The failed handshake only cost that one session; the server still
    // accepts properly verified clients.
    assert!(server.listening());
    let good = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    good.set_use_tls(true);
    good.set_ca_file(&certs.ca_file);
    good.set_verify_peer(true);
    good.connect("127.0.0.1", &port.to_string()).unwrap();
    good.write(b"again");
    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        good.with_handler(|h| h.received.len() >= 5)
    }));
    good.with_handler(|h| assert_eq!(h.received, b"again"));
}

#[test]
fn subject_name_match_accepts() {
    let certs = write_certs("cn-ok", "localhost");
    let reactor = Reactor::new().unwrap();
    let server = tls_echo_server(&reactor, &certs);
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    client.set_use_tls(true);
    client.set_ca_file(&certs.ca_file);
    client.set_verify_peer(true);
    client.set_check_peer_subject_name(true);
    client.connect("localhost", &port.to_string()).unwrap();
    client.write(b"named");

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        client.with_handler(|h| h.received.len() >= 5)
    }));
    client.with_handler(|h| assert_eq!(h.received, b"named"));
}

#[test]
fn subject_name_mismatch_disconnects() {
    let certs = write_certs("cn-bad", "localhost");
    let reactor = Reactor::new().unwrap();
    let server = tls_echo_server(&reactor, &certs);
    let port = server.local_addr().unwrap().port();

    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    client.set_use_tls(true);
    client.set_ca_file(&certs.ca_file);
    client.set_verify_peer(true);
    client.set_check_peer_subject_name(true);
    // The certificate names localhost; connecting by address must fail
    // the post-handshake subject check.
    client.connect("127.0.0.1", &port.to_string()).unwrap();
    client.write(b"never");

    assert!(pump_until(&reactor, Duration::from_secs(5), || {
        client.state() == SocketState::Disconnected
    }));
    client.with_handler(|h| {
        assert!(!h.connected);
        assert!(h.received.is_empty());
    });
}

#[test]
fn subject_check_requires_verify_peer() {
    let reactor = Reactor::new().unwrap();
    let client = Client::new(&reactor, Domain::V4, false, Collector::default()).unwrap();
    client.set_use_tls(true);
    client.set_check_peer_subject_name(true);
    assert!(matches!(
        client.connect("127.0.0.1", "443"),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(client.state(), SocketState::Unconnected);
}
