//! TLS transport
//!
//! An `SslStream` cannot be split, so both halves share it behind a mutex.
//! The reader polls the socket without holding the lock and takes it only
//! to read, so a reader waiting for input never stalls the writer.

use super::ALPN_H2;
use crate::http::h2::Result;
use crate::http::session::{poll_fd, PollEvents, Transport, TransportWriter};
use openssl::ssl::SslStream;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long one read attempt may hold the stream lock
const READ_SLICE: Duration = Duration::from_millis(50);

/// TLS connection after a successful handshake
pub struct TlsTransport {
    stream: Arc<Mutex<SslStream<TcpStream>>>,
    fd: RawFd,
    alpn: Option<Vec<u8>>,
    read_timeout: Option<Duration>,
}

impl TlsTransport {
    pub(super) fn new(stream: SslStream<TcpStream>) -> Result<Self> {
        // A partial record must not pin the lock: bound every blocking read
        stream.get_ref().set_read_timeout(Some(READ_SLICE))?;
        let fd = stream.get_ref().as_raw_fd();
        let alpn = stream.ssl().selected_alpn_protocol().map(<[u8]>::to_vec);
        Ok(TlsTransport {
            stream: Arc::new(Mutex::new(stream)),
            fd,
            alpn,
            read_timeout: None,
        })
    }

    /// Protocol selected during the handshake
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn is_h2(&self) -> bool {
        self.alpn_protocol() == Some(ALPN_H2)
    }

    /// Negotiated TLS version, e.g. "TLSv1.3"
    pub fn version(&self) -> &'static str {
        self.stream.lock().ssl().version_str()
    }
}

impl Transport for TlsTransport {
    type Reader = TlsReader;
    type Writer = TlsWriter;

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.lock().get_ref().peer_addr()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn split(self) -> io::Result<(TlsReader, TlsWriter)> {
        let reader = TlsReader {
            stream: Arc::clone(&self.stream),
            fd: self.fd,
            idle_timeout: self.read_timeout,
        };
        let writer = TlsWriter {
            stream: self.stream,
        };
        Ok((reader, writer))
    }
}

/// Read half of a [`TlsTransport`]
pub struct TlsReader {
    stream: Arc<Mutex<SslStream<TcpStream>>>,
    fd: RawFd,
    idle_timeout: Option<Duration>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.idle_timeout.map(|t| Instant::now() + t);
        loop {
            let buffered = self.stream.lock().ssl().pending() > 0;
            if buffered || poll_fd(self.fd, PollEvents::Read, Some(READ_SLICE))? {
                match self.stream.lock().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock
                                | io::ErrorKind::TimedOut
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => return Err(e),
                }
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "TLS read timed out"));
            }
        }
    }
}

/// Write half of a [`TlsTransport`]
pub struct TlsWriter {
    stream: Arc<Mutex<SslStream<TcpStream>>>,
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.lock().flush()
    }
}

impl TransportWriter for TlsWriter {
    fn close(&mut self) -> io::Result<()> {
        let mut stream = self.stream.lock();
        // close_notify is best effort; the peer may be gone already
        let _ = stream.shutdown();
        match stream.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::{TlsAcceptorBuilder, TlsConnectorBuilder};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_handshake_and_split_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptorBuilder::new().unwrap().build().unwrap();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let transport = acceptor.accept(tcp).unwrap();
            assert!(transport.is_h2());
            let (mut reader, mut writer) = transport.split().unwrap();

            let mut buf = [0u8; 5];
            reader.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"Hello");
            writer.write_all(b"World").unwrap();
            writer.flush().unwrap();

            // Wait for the client to hang up
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let connector = TlsConnectorBuilder::new().unwrap().build();
        let transport = connector.connect("example.com", tcp).unwrap();
        assert_eq!(transport.alpn_protocol(), Some(&b"h2"[..]));
        assert!(transport.version().starts_with("TLS"));

        let (mut reader, mut writer) = transport.split().unwrap();
        writer.write_all(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"World");
        writer.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn test_idle_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptorBuilder::new().unwrap().build().unwrap();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let mut transport = acceptor.accept(tcp).unwrap();
            transport
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let (mut reader, _writer) = transport.split().unwrap();
            let err = reader.read(&mut [0u8; 16]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let connector = TlsConnectorBuilder::new().unwrap().build();
        let _transport = connector.connect("example.com", tcp).unwrap();

        server.join().unwrap();
    }
}
