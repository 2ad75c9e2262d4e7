//! TLS transport with ALPN `h2`
//!
//! [`TlsAcceptor`] runs the server handshake and hands back a
//! [`TlsTransport`] the HTTP/2 server can drive like a plain socket.
//! [`TlsConnector`] is the client counterpart.
//!
//! ```no_run
//! use h2push::http::h2::H2ServerBuilder;
//! use h2push::http::tls::TlsAcceptorBuilder;
//! use h2push::site::DemoSite;
//! use std::net::TcpListener;
//!
//! # fn example() -> h2push::http::h2::Result<()> {
//! let acceptor = TlsAcceptorBuilder::new()?.cert_file("server.pem")?.build()?;
//! let server = H2ServerBuilder::new(DemoSite::new()).tls(acceptor).build();
//! server.serve(TcpListener::bind("127.0.0.1:6565")?)?;
//! # Ok(())
//! # }
//! ```

pub mod builtin_cert;
pub mod config;
pub mod session;

pub use config::{TlsAcceptor, TlsAcceptorBuilder, TlsConnector, TlsConnectorBuilder, TlsVersion};
pub use session::{TlsReader, TlsTransport, TlsWriter};

/// ALPN protocol id of HTTP/2 over TLS
pub const ALPN_H2: &[u8] = b"h2";
