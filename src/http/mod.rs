//! HTTP/2 over plain TCP or TLS
//!
//! - [`h2`]: the protocol engine and the threaded server around it
//! - [`session`]: the [`Transport`](session::Transport) abstraction
//! - [`tls`]: OpenSSL transport negotiating `h2` through ALPN

pub mod h2;
pub mod session;
pub mod tls;

pub use session::{Transport, TransportWriter};
