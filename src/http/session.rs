//! Transport abstraction
//!
//! The HTTP/2 server runs over anything that moves bytes both ways and can
//! be split into a reader and a writer used from different threads. Plain
//! TCP (h2c with prior knowledge) and TLS both implement [`Transport`].

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::time::Duration;

/// Bidirectional byte stream
pub trait Transport: Send + Sized + 'static {
    type Reader: Read + Send + 'static;
    type Writer: TransportWriter + 'static;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Give up reading after `timeout` without input (`None` waits forever)
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Split into halves that can live on separate threads
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}

/// Write half of a [`Transport`]
pub trait TransportWriter: Write + Send {
    /// Shut the transport down in both directions
    ///
    /// A reader blocked on the other half wakes up with EOF or an error.
    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn split(self) -> io::Result<(TcpStream, TcpStream)> {
        let writer = self.try_clone()?;
        Ok((self, writer))
    }
}

impl TransportWriter for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Already gone
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Pending connections the listener queues
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Bind a listening socket with SO_REUSEADDR and the given backlog
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Wait until `fd` is ready for `events`
///
/// Returns false on timeout; `None` waits forever.
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    // SAFETY: `pfd` is a valid pollfd for the duration of the call
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(result > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::thread;

    #[test]
    fn test_tcp_split_halves() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let echo = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        assert_eq!(Transport::peer_addr(&stream).unwrap(), addr);
        let (mut reader, mut writer) = stream.split().unwrap();

        writer.write_all(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Hello");

        echo.join().unwrap();
        writer.close().unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_bind_listener() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        drop(accepted);
    }

    #[test]
    fn test_poll_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let idle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let stream = TcpStream::connect(addr).unwrap();
        let fd = stream.as_raw_fd();
        assert!(!poll_fd(fd, PollEvents::Read, Some(Duration::from_millis(50))).unwrap());
        assert!(poll_fd(fd, PollEvents::Write, Some(Duration::from_millis(50))).unwrap());

        idle.join().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let idle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        Transport::set_read_timeout(&mut stream, Some(Duration::from_millis(50))).unwrap();
        let (mut reader, _writer) = stream.split().unwrap();
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));

        idle.join().unwrap();
    }
}
