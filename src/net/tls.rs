//! TLS over a [`crate::net::tcp::Socket`], driven explicitly from its
//! `raw_recv`/`raw_send` primitives rather than wrapping a blocking stream.
//!
//! `rustls` is sans-IO: a [`rustls::ClientConnection`] /
//! [`rustls::ServerConnection`] only ever reads and writes to in-memory
//! buffers, and it's the caller's job to pump ciphertext to and from the
//! actual transport. That's exactly the shape this crate's `io_uring`
//! event loop wants — no blocking read call to wrap, just `raw_recv`/
//! `raw_send` calls interleaved with the connection's `read_tls`/
//! `write_tls`/`process_new_packets`.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::error::{SharedError, SocketError};
use crate::net::tcp::Socket;

pub use rustls::RootCertStore;

/// Configuration for [`Socket::connect`]'s client-side TLS upgrade.
#[derive(Clone)]
pub struct ClientConfig {
    inner: Arc<rustls::ClientConfig>,
}

impl ClientConfig {
    /// Verifies the peer against the Mozilla root set shipped by
    /// `webpki-roots`, plus anything in `extra_roots`.
    pub fn new(extra_roots: impl IntoIterator<Item = rustls::pki_types::CertificateDer<'static>>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            let _ = roots.add(root);
        }

        let inner = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        ClientConfig { inner: Arc::new(inner) }
    }

    /// Accepts a self-signed (or otherwise unverifiable) peer certificate —
    /// spec.md 6's "allow self-signed when opted in". Off by default.
    pub fn allow_self_signed(mut self) -> Self {
        let mut inner = (*self.inner).clone();
        inner
            .dangerous()
            .set_certificate_verifier(Arc::new(verify::AcceptAny));
        self.inner = Arc::new(inner);
        self
    }
}

/// Configuration for [`crate::net::tcp::Server::listen`]'s server-side TLS.
#[derive(Clone)]
pub struct ServerConfig {
    inner: Arc<rustls::ServerConfig>,
}

impl ServerConfig {
    pub fn new(
        cert_chain: Vec<rustls::pki_types::CertificateDer<'static>>,
        private_key: rustls::pki_types::PrivateKeyDer<'static>,
    ) -> Result<Self, SocketError> {
        let inner = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| SocketError::Tls(SharedError::new(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))))?;

        Ok(ServerConfig { inner: Arc::new(inner) })
    }
}

enum Inner {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

/// An established (or handshaking) TLS session, pumped by [`Socket::read`]
/// and [`Socket::write`] whenever the socket has been `encrypt`ed.
pub struct Session {
    conn: Inner,
    plaintext: VecDeque<u8>,
}

/// A generic `io_uring`-driven transport a [`Session`] pumps ciphertext
/// through. Implemented by [`Socket`]'s raw (non-TLS) read/write.
pub(crate) trait RawTransport {
    fn raw_recv(&self, buffer: &mut [u8]) -> crate::IoResult<usize>;
    fn raw_send(&self, buffer: &[u8]) -> crate::IoResult<usize>;
}

impl RawTransport for Socket {
    fn raw_recv(&self, buffer: &mut [u8]) -> crate::IoResult<usize> {
        Socket::raw_recv(self, buffer)
    }

    fn raw_send(&self, buffer: &[u8]) -> crate::IoResult<usize> {
        Socket::raw_send(self, buffer)
    }
}

const CIPHERTEXT_BUFFER: usize = 16 * 1024;

impl Session {
    pub(crate) fn connect(config: &ClientConfig, server_name: &str) -> Result<Self, SocketError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| SocketError::Verification(format!("invalid DNS name: {server_name}")))?;
        let conn = rustls::ClientConnection::new(config.inner.clone(), name)
            .map_err(|e| SocketError::Tls(SharedError::new(io::Error::new(io::ErrorKind::Other, e.to_string()))))?;

        Ok(Session { conn: Inner::Client(conn), plaintext: VecDeque::new() })
    }

    pub(crate) fn accept(config: &ServerConfig) -> Result<Self, SocketError> {
        let conn = rustls::ServerConnection::new(config.inner.clone())
            .map_err(|e| SocketError::Tls(SharedError::new(io::Error::new(io::ErrorKind::Other, e.to_string()))))?;

        Ok(Session { conn: Inner::Server(conn), plaintext: VecDeque::new() })
    }

    fn is_handshaking(&self) -> bool {
        match &self.conn {
            Inner::Client(c) => c.is_handshaking(),
            Inner::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match &self.conn {
            Inner::Client(c) => c.wants_read(),
            Inner::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.conn {
            Inner::Client(c) => c.wants_write(),
            Inner::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut cursor = bytes;
        match &mut self.conn {
            Inner::Client(c) => c.read_tls(&mut cursor),
            Inner::Server(c) => c.read_tls(&mut cursor),
        }
    }

    fn write_tls(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        match &mut self.conn {
            Inner::Client(c) => c.write_tls(out),
            Inner::Server(c) => c.write_tls(out),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, SocketError> {
        let result = match &mut self.conn {
            Inner::Client(c) => c.process_new_packets(),
            Inner::Server(c) => c.process_new_packets(),
        };
        result.map_err(|e| SocketError::Tls(SharedError::new(io::Error::new(io::ErrorKind::Other, e.to_string()))))
    }

    fn drain_plaintext(&mut self) -> io::Result<()> {
        let mut buffer = [0u8; 4096];
        loop {
            let read = match &mut self.conn {
                Inner::Client(c) => c.reader().read(&mut buffer),
                Inner::Server(c) => c.reader().read(&mut buffer),
            };
            match read {
                Ok(0) => return Ok(()),
                Ok(n) => self.plaintext.extend(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn writer_write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.conn {
            Inner::Client(c) => c.writer().write_all(data),
            Inner::Server(c) => c.writer().write_all(data),
        }
    }

    /// Pumps ciphertext through `transport` until no more I/O is wanted
    /// (handshake step, or the connection has nothing left to send/recv
    /// right now).
    fn pump(&mut self, transport: &impl RawTransport) -> Result<(), SocketError> {
        let io_err = |e: io::Error| SocketError::Io(SharedError::new(e));

        while self.wants_write() {
            let mut out = Vec::new();
            self.write_tls(&mut out).map_err(io_err)?;
            if !out.is_empty() {
                transport_write_all(transport, &out)?;
            }
        }

        if self.wants_read() {
            let mut buffer = [0u8; CIPHERTEXT_BUFFER];
            let n = transport.raw_recv(&mut buffer).map_err(|e| SocketError::Io(SharedError::new(io::Error::from(e))))?;
            if n == 0 {
                return Err(SocketError::Io(SharedError::new(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during TLS"))));
            }
            self.read_tls(&buffer[..n]).map_err(io_err)?;
            self.process_new_packets()?;
            self.drain_plaintext().map_err(io_err)?;
        }

        Ok(())
    }

    /// Drives the handshake to completion.
    pub(crate) fn handshake(&mut self, transport: &impl RawTransport) -> Result<(), SocketError> {
        while self.is_handshaking() {
            self.pump(transport)?;
        }
        Ok(())
    }

    /// Reads up to `limit` plaintext bytes, pumping more ciphertext through
    /// `transport` as needed.
    pub(crate) fn read(&mut self, transport: &impl RawTransport, limit: usize) -> Result<Vec<u8>, SocketError> {
        while self.plaintext.is_empty() {
            self.pump(transport)?;
        }

        let take = self.plaintext.len().min(limit.max(1));
        Ok(self.plaintext.drain(..take).collect())
    }

    /// Encrypts and sends `data`, flushing every resulting ciphertext
    /// record through `transport`.
    pub(crate) fn write(&mut self, transport: &impl RawTransport, data: &[u8]) -> Result<usize, SocketError> {
        self.writer_write_all(data).map_err(|e| SocketError::Io(SharedError::new(e)))?;

        while self.wants_write() {
            let mut out = Vec::new();
            self.write_tls(&mut out).map_err(|e| SocketError::Io(SharedError::new(e)))?;
            if !out.is_empty() {
                transport_write_all(transport, &out)?;
            }
        }

        Ok(data.len())
    }
}

fn transport_write_all(transport: &impl RawTransport, mut data: &[u8]) -> Result<(), SocketError> {
    while !data.is_empty() {
        let n = transport
            .raw_send(data)
            .map_err(|e| SocketError::Io(SharedError::new(io::Error::from(e))))?;
        data = &data[n..];
    }
    Ok(())
}

/// Hostname verification (spec.md 6): the wildcard-matching primitive
/// behind both SAN and CN matching, with the wildcard rule restricted to
/// a single leftmost label matching exactly one DNS label.
///
/// The default (non-self-signed) path delegates name matching entirely to
/// `rustls`'s own verifier, which already applies this exact wildcard rule
/// to SAN entries (RFC 6125) — so [`matches_hostname`] isn't re-invoked on
/// that path, it would just recompute what `rustls` already decided. CN
/// fallback for SAN-less leaf certificates would need this crate to parse
/// the certificate's Subject itself (`rustls`'s verifier trait hands back
/// only a pass/fail, not the parsed fields); that's real X.509 ASN.1 work
/// with no corpus precedent to ground it on, so it's left undone here.
/// `matches_hostname` stays exposed and tested as the reusable primitive —
/// e.g. for a server selecting a `ServerConfig` by SNI pattern.
pub mod verify {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Matches `hostname` against a CN or SAN `pattern`, per spec.md 6's
    /// wildcard rule: a `*` may appear once, only as the entire leftmost
    /// label, and matches exactly one DNS label (never `.`, never two
    /// labels at once).
    pub fn matches_hostname(pattern: &str, hostname: &str) -> bool {
        let pattern_labels: Vec<&str> = pattern.split('.').collect();
        let host_labels: Vec<&str> = hostname.split('.').collect();

        if pattern_labels.len() != host_labels.len() {
            return false;
        }

        for (i, pattern_label) in pattern_labels.iter().enumerate() {
            if i == 0 && *pattern_label == "*" {
                if host_labels[0].is_empty() {
                    return false;
                }
                continue;
            }
            if !pattern_label.eq_ignore_ascii_case(host_labels[i]) {
                return false;
            }
        }

        true
    }

    /// A verifier that accepts any certificate — backs
    /// [`super::ClientConfig::allow_self_signed`]. Never used unless a
    /// caller opts in explicitly.
    #[derive(Debug)]
    pub(crate) struct AcceptAny;

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ED25519,
            ]
        }
    }

    #[allow(unused)]
    fn _assert_send_sync() {
        fn assert<T: Send + Sync>() {}
        assert::<Arc<AcceptAny>>();
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn exact_match() {
            assert!(matches_hostname("example.com", "example.com"));
        }

        #[test]
        fn wildcard_matches_one_label() {
            assert!(matches_hostname("*.example.com", "www.example.com"));
            assert!(!matches_hostname("*.example.com", "a.b.example.com"));
        }

        #[test]
        fn wildcard_must_be_leftmost_and_whole_label() {
            assert!(!matches_hostname("www.*.com", "www.example.com"));
            assert!(!matches_hostname("w*.example.com", "www.example.com"));
        }

        #[test]
        fn mismatched_label_count_fails() {
            assert!(!matches_hostname("example.com", "sub.example.com"));
        }

        #[test]
        fn case_insensitive() {
            assert!(matches_hostname("Example.COM", "example.com"));
        }
    }
}
