//! TLS acceptor and connector configuration
//!
//! Both ends advertise exactly one ALPN protocol, `h2`. An acceptor that
//! has no certificate configured falls back to the built-in one.

use super::builtin_cert::BUILTIN_CERT;
use super::session::TlsTransport;
use super::ALPN_H2;
use crate::http::h2::{Error, Result};
use openssl::pkey::PKey;
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslContext, SslContextBuilder, SslMethod, SslVerifyMode,
    SslVersion,
};
use openssl::x509::X509;
use std::fs;
use std::net::TcpStream;
use std::path::Path;
use tracing::debug;

/// Wire-format ALPN list: one length-prefixed entry
const ALPN_WIRE: &[u8] = b"\x02h2";

/// Lowest TLS version accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse "TLSv1.2" or "TLSv1.3" (case-insensitive, "v" optional)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Some(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    fn to_openssl(self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// Load a certificate and its private key from one PEM bundle
fn load_identity(ctx: &mut SslContextBuilder, pem: &[u8]) -> Result<()> {
    let cert = X509::from_pem(pem)
        .map_err(|e| Error::Tls(format!("failed to load certificate: {}", e)))?;
    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| Error::Tls(format!("failed to load private key: {}", e)))?;
    ctx.set_certificate(&cert)?;
    ctx.set_private_key(&key)?;
    ctx.check_private_key()?;
    Ok(())
}

/// Server-side TLS configuration builder
pub struct TlsAcceptorBuilder {
    ctx: SslContextBuilder,
    has_cert: bool,
}

impl TlsAcceptorBuilder {
    pub fn new() -> Result<Self> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        ctx.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        ctx.set_alpn_select_callback(|_ssl, client_protos| {
            select_next_proto(ALPN_WIRE, client_protos).ok_or(AlpnError::NOACK)
        });
        Ok(TlsAcceptorBuilder {
            ctx,
            has_cert: false,
        })
    }

    /// Use the certificate and key from a PEM bundle file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let pem = fs::read(path.as_ref())?;
        load_identity(&mut self.ctx, &pem)?;
        self.has_cert = true;
        Ok(self)
    }

    /// Use the certificate and key from an in-memory PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self> {
        load_identity(&mut self.ctx, pem)?;
        self.has_cert = true;
        Ok(self)
    }

    pub fn min_version(mut self, version: TlsVersion) -> Result<Self> {
        self.ctx.set_min_proto_version(Some(version.to_openssl()))?;
        Ok(self)
    }

    pub fn build(mut self) -> Result<TlsAcceptor> {
        if !self.has_cert {
            debug!("no certificate configured, using the built-in one");
            load_identity(&mut self.ctx, BUILTIN_CERT.as_bytes())?;
        }
        Ok(TlsAcceptor {
            ctx: self.ctx.build(),
        })
    }
}

/// Accepts TLS connections that negotiate `h2`
#[derive(Clone)]
pub struct TlsAcceptor {
    ctx: SslContext,
}

impl TlsAcceptor {
    /// Run the server handshake on an accepted socket
    ///
    /// Peers that do not select `h2` through ALPN are rejected.
    pub fn accept(&self, stream: TcpStream) -> Result<TlsTransport> {
        let ssl = Ssl::new(&self.ctx)?;
        let stream = ssl
            .accept(stream)
            .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))?;
        if stream.ssl().selected_alpn_protocol() != Some(ALPN_H2) {
            return Err(Error::Tls("peer did not negotiate h2".into()));
        }
        TlsTransport::new(stream)
    }
}

/// Client-side TLS configuration builder
pub struct TlsConnectorBuilder {
    ctx: SslContextBuilder,
}

impl TlsConnectorBuilder {
    /// Peer verification is off until [`verify_peer`](Self::verify_peer)
    pub fn new() -> Result<Self> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        ctx.set_alpn_protos(ALPN_WIRE)?;
        ctx.set_verify(SslVerifyMode::NONE);
        Ok(TlsConnectorBuilder { ctx })
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.ctx.set_verify(if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        self
    }

    /// Trust the certificates in a PEM file
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.ctx.set_ca_file(path.as_ref())?;
        Ok(self)
    }

    pub fn build(self) -> TlsConnector {
        TlsConnector {
            ctx: self.ctx.build(),
        }
    }
}

/// Opens TLS connections offering `h2`
#[derive(Clone)]
pub struct TlsConnector {
    ctx: SslContext,
}

impl TlsConnector {
    /// Run the client handshake, sending `servername` as SNI
    pub fn connect(&self, servername: &str, stream: TcpStream) -> Result<TlsTransport> {
        let mut ssl = Ssl::new(&self.ctx)?;
        ssl.set_hostname(servername)?;
        let stream = ssl
            .connect(stream)
            .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))?;
        if stream.ssl().selected_alpn_protocol() != Some(ALPN_H2) {
            return Err(Error::Tls("server did not select h2".into()));
        }
        TlsTransport::new(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!(TlsVersion::parse("TLSv1.2"), Some(TlsVersion::Tls12));
        assert_eq!(TlsVersion::parse("tls1.3"), Some(TlsVersion::Tls13));
        assert_eq!(TlsVersion::parse("SSLv3"), None);
        assert!(TlsVersion::Tls12 < TlsVersion::Tls13);
    }

    #[test]
    fn test_acceptor_with_builtin_cert() {
        let acceptor = TlsAcceptorBuilder::new()
            .unwrap()
            .min_version(TlsVersion::Tls13)
            .unwrap()
            .build();
        assert!(acceptor.is_ok());
    }

    #[test]
    fn test_acceptor_rejects_garbage_pem() {
        let result = TlsAcceptorBuilder::new()
            .unwrap()
            .cert_pem(b"not a certificate");
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[test]
    fn test_missing_cert_file() {
        let result = TlsAcceptorBuilder::new()
            .unwrap()
            .cert_file("/nonexistent/server.pem");
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
