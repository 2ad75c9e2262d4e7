//! HTTP/2 server
//!
//! Every accepted transport gets three threads:
//!
//! - a reader that turns socket input into [`Inbound`] messages,
//! - the engine thread that owns the [`Connection`], feeds it those
//!   messages in order and calls the [`Handler`],
//! - a writer that drains encoded frames into the socket.
//!
//! A slow peer therefore only ever blocks the writer; the engine keeps
//! processing input, including the WINDOW_UPDATEs that unblock it.

use super::connection::{Connection, ConnectionEvent};
use super::error::{Error, ErrorCode, Result};
use super::frame_logger::FrameLogger;
use super::hpack::HeaderBlock;
use super::settings::Settings;
use super::stream::StreamId;
use crate::http::session::{Transport, TransportWriter};
use crate::http::tls::TlsAcceptor;
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Application callbacks, shared by every connection of a server
pub trait Handler: Send + Sync + 'static {
    /// A complete request arrived; answer it through `responder`
    fn on_request(&self, request: Request, responder: &mut Responder<'_>);

    /// A stream ended abnormally (reset, connection error or lost transport)
    fn on_stream_aborted(&self, stream_id: StreamId, code: ErrorCode) {
        debug!(stream_id, %code, "stream aborted");
    }
}

/// A complete request
#[derive(Debug, Clone)]
pub struct Request {
    stream_id: StreamId,
    headers: HeaderBlock,
    body: Bytes,
}

impl Request {
    pub fn new(stream_id: StreamId, headers: HeaderBlock, body: Bytes) -> Self {
        Request {
            stream_id,
            headers,
            body,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn headers(&self) -> &HeaderBlock {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn method(&self) -> &str {
        self.headers.method().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.headers.path().unwrap_or_default()
    }
}

/// Answers one request stream
pub struct Responder<'a> {
    conn: &'a mut Connection,
    stream_id: StreamId,
}

impl<'a> Responder<'a> {
    pub fn new(conn: &'a mut Connection, stream_id: StreamId) -> Self {
        Responder { conn, stream_id }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Queue the response headers and body
    pub fn send_response(&mut self, headers: HeaderBlock, body: Bytes, end_stream: bool) -> Result<()> {
        self.conn
            .send_response(self.stream_id, headers, body, end_stream)
    }

    /// Queue more body after a response sent without END_STREAM
    pub fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        self.conn.send_data(self.stream_id, data, end_stream)
    }

    /// Push a response for `request_headers`; call before `send_response`
    /// so the promise reaches the client ahead of the document that
    /// references it
    ///
    /// Returns the promised stream, or `None` when the client refuses pushes.
    pub fn push_promise(
        &mut self,
        request_headers: HeaderBlock,
        response_headers: HeaderBlock,
        body: Bytes,
    ) -> Result<Option<StreamId>> {
        self.conn
            .push_promise(self.stream_id, request_headers, response_headers, body)
    }

    /// Whether the client accepts pushes
    pub fn push_enabled(&self) -> bool {
        self.conn.remote_settings().enable_push()
    }

    /// Whether the stream can still carry a response
    pub fn is_alive(&self) -> bool {
        self.conn.is_stream_writable(self.stream_id)
    }

    /// Abandon the stream
    pub fn reset(&mut self, code: ErrorCode) {
        self.conn.reset_stream(self.stream_id, code);
    }
}

/// Reader thread to engine thread
enum Inbound {
    Data(Bytes),
    Eof,
    Failed(io::Error),
}

/// Configures an [`H2Server`]
pub struct H2ServerBuilder<H> {
    handler: H,
    settings: Settings,
    read_timeout: Option<Duration>,
    tls: Option<TlsAcceptor>,
    frame_logger: Option<FrameLogger>,
}

impl<H: Handler> H2ServerBuilder<H> {
    pub fn new(handler: H) -> Self {
        H2ServerBuilder {
            handler,
            settings: Settings::new(),
            read_timeout: None,
            tls: None,
            frame_logger: None,
        }
    }

    /// Settings sent at the start of every connection
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Close connections idle for longer than `timeout`
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Serve HTTP/2 over TLS instead of cleartext
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Log every frame under the `h2push::frame` target
    pub fn frame_logger(mut self, logger: FrameLogger) -> Self {
        self.frame_logger = Some(logger);
        self
    }

    pub fn build(self) -> H2Server<H> {
        H2Server {
            handler: Arc::new(self.handler),
            settings: self.settings,
            read_timeout: self.read_timeout,
            tls: self.tls,
            frame_logger: self.frame_logger,
        }
    }
}

/// HTTP/2 server
pub struct H2Server<H> {
    handler: Arc<H>,
    settings: Settings,
    read_timeout: Option<Duration>,
    tls: Option<TlsAcceptor>,
    frame_logger: Option<FrameLogger>,
}

impl<H> Clone for H2Server<H> {
    fn clone(&self) -> Self {
        H2Server {
            handler: Arc::clone(&self.handler),
            settings: self.settings.clone(),
            read_timeout: self.read_timeout,
            tls: self.tls.clone(),
            frame_logger: self.frame_logger,
        }
    }
}

impl<H: Handler> H2Server<H> {
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Accept connections until the listener fails
    ///
    /// Each connection is served on its own threads.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            addr = ?listener.local_addr().ok(),
            tls = self.tls.is_some(),
            "accepting connections"
        );
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = self.clone();
            thread::Builder::new()
                .name("h2-conn".into())
                .spawn(move || server.handle_accepted(stream))?;
        }
        Ok(())
    }

    fn handle_accepted(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle");
        }
        debug!(?peer, "connection accepted");

        let result = match &self.tls {
            Some(acceptor) => acceptor
                .accept(stream)
                .and_then(|transport| self.serve_connection(transport)),
            None => self.serve_connection(stream),
        };
        match result {
            Ok(()) => debug!(?peer, "connection finished"),
            Err(e) => info!(?peer, error = %e, "connection ended with error"),
        }
    }

    /// Serve one transport on the current thread until it is done
    pub fn serve_connection<T: Transport>(&self, mut transport: T) -> Result<()> {
        transport.set_read_timeout(self.read_timeout)?;
        let (reader, writer) = transport.split()?;

        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let reader_thread = thread::Builder::new()
            .name("h2-reader".into())
            .spawn(move || read_loop(reader, inbound_tx))?;
        let writer_thread = thread::Builder::new()
            .name("h2-writer".into())
            .spawn(move || write_loop(writer, outbound_rx))?;

        let mut conn = Connection::server(self.settings.clone());
        if let Some(logger) = self.frame_logger {
            conn = conn.with_frame_logger(logger);
        }
        let result = self.drive(&mut conn, &inbound_rx, &outbound_tx);

        // Dropping the sender lets the writer drain and close the transport,
        // which in turn wakes the reader.
        drop(outbound_tx);
        if writer_thread.join().is_err() {
            warn!("writer thread panicked");
        }
        drop(inbound_rx);
        if reader_thread.join().is_err() {
            warn!("reader thread panicked");
        }
        result
    }

    fn drive(
        &self,
        conn: &mut Connection,
        inbound: &Receiver<Inbound>,
        outbound: &Sender<Bytes>,
    ) -> Result<()> {
        self.flush(conn, outbound)?;
        loop {
            match inbound.recv().unwrap_or(Inbound::Eof) {
                Inbound::Data(bytes) => {
                    let result = conn.recv(&bytes);
                    self.dispatch(conn);
                    self.flush(conn, outbound)?;
                    result?;
                }
                Inbound::Eof => {
                    debug!("peer closed the transport");
                    conn.transport_closed();
                    self.dispatch(conn);
                    return Ok(());
                }
                Inbound::Failed(e) => {
                    conn.transport_closed();
                    self.dispatch(conn);
                    return Err(Error::Transport(e));
                }
            }
            if conn.is_finished() {
                self.flush(conn, outbound)?;
                return Ok(());
            }
        }
    }

    /// Hand every pending event to the handler
    fn dispatch(&self, conn: &mut Connection) {
        while let Some(event) = conn.poll_event() {
            match event {
                ConnectionEvent::Request {
                    stream_id,
                    headers,
                    body,
                } => {
                    let request = Request::new(stream_id, headers, body);
                    debug!(stream_id, method = request.method(), path = request.path(), "request");
                    let mut responder = Responder::new(conn, stream_id);
                    self.handler.on_request(request, &mut responder);
                }
                ConnectionEvent::StreamAborted { stream_id, code } => {
                    self.handler.on_stream_aborted(stream_id, code);
                }
                ConnectionEvent::GoAway {
                    last_stream_id,
                    code,
                    ..
                } => {
                    info!(last_stream_id, %code, "client is going away");
                }
                other => debug!(?other, "ignoring client-side event"),
            }
        }
    }

    fn flush(&self, conn: &mut Connection, outbound: &Sender<Bytes>) -> Result<()> {
        let bytes = conn.take_output();
        if bytes.is_empty() {
            return Ok(());
        }
        if outbound.send(bytes).is_err() {
            // Writer is gone: the transport failed underneath us
            conn.transport_closed();
            self.dispatch(conn);
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

fn read_loop<R: Read>(mut reader: R, tx: Sender<Inbound>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let message = match reader.read(&mut buf) {
            Ok(0) => Inbound::Eof,
            Ok(n) => Inbound::Data(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Inbound::Failed(e),
        };
        let last = !matches!(message, Inbound::Data(_));
        if tx.send(message).is_err() || last {
            return;
        }
    }
}

fn write_loop<W: TransportWriter>(mut writer: W, rx: Receiver<Bytes>) {
    for bytes in rx {
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            debug!(error = %e, "write failed");
            break;
        }
    }
    if let Err(e) = writer.close() {
        debug!(error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::codec::FrameCodec;
    use crate::http::h2::frames::{Frame, HeadersFrame, SettingsFrame};
    use crate::http::h2::hpack::Encoder;
    use crate::http::h2::CONNECTION_PREFACE;
    use parking_lot::Mutex;

    /// Records what the engine reported
    #[derive(Default)]
    struct Recorder {
        paths: Mutex<Vec<String>>,
        aborted: Mutex<Vec<(StreamId, ErrorCode)>>,
    }

    impl Handler for Recorder {
        fn on_request(&self, request: Request, responder: &mut Responder<'_>) {
            self.paths.lock().push(request.path().to_string());
            assert!(responder.is_alive());
            responder
                .send_response(
                    HeaderBlock::new().with(":status", "204"),
                    Bytes::new(),
                    true,
                )
                .unwrap();
            assert!(!responder.is_alive());
        }

        fn on_stream_aborted(&self, stream_id: StreamId, code: ErrorCode) {
            self.aborted.lock().push((stream_id, code));
        }
    }

    fn ready_server() -> Connection {
        let mut conn = Connection::server(Settings::new());
        let mut input = CONNECTION_PREFACE.to_vec();
        input.extend_from_slice(&FrameCodec::encode(&SettingsFrame::new(Settings::new()).into()));
        conn.recv(&input).unwrap();
        conn.take_output();
        conn
    }

    #[test]
    fn test_dispatch_calls_handler() {
        let server = H2ServerBuilder::new(Recorder::default()).build();
        let mut conn = ready_server();

        let block = Encoder::new().encode(
            &HeaderBlock::new()
                .with(":method", "GET")
                .with(":scheme", "http")
                .with(":path", "/hello"),
        );
        let frame: Frame = HeadersFrame::new(1, block, false, true).into();
        conn.recv(&FrameCodec::encode(&frame)).unwrap();
        // Request is not complete yet
        server.dispatch(&mut conn);
        assert!(server.handler().paths.lock().is_empty());

        conn.transport_closed();
        server.dispatch(&mut conn);
        assert_eq!(
            *server.handler().aborted.lock(),
            vec![(1, ErrorCode::Cancel)]
        );
    }

    #[test]
    fn test_responder_answers_stream() {
        let server = H2ServerBuilder::new(Recorder::default()).build();
        let mut conn = ready_server();

        let block = Encoder::new().encode(
            &HeaderBlock::new()
                .with(":method", "GET")
                .with(":scheme", "http")
                .with(":path", "/done"),
        );
        let frame: Frame = HeadersFrame::new(1, block, true, true).into();
        conn.recv(&FrameCodec::encode(&frame)).unwrap();
        server.dispatch(&mut conn);

        assert_eq!(*server.handler().paths.lock(), vec!["/done".to_string()]);
        let mut codec = FrameCodec::new();
        codec.feed(&conn.take_output());
        match codec.next_frame().unwrap() {
            Some(Frame::Headers(h)) => {
                assert_eq!(h.stream_id, 1);
                assert!(h.end_stream);
            }
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }

    #[test]
    fn test_request_accessors() {
        let request = Request::new(
            3,
            HeaderBlock::new().with(":method", "POST").with(":path", "/form"),
            Bytes::from_static(b"a=1"),
        );
        assert_eq!(request.stream_id(), 3);
        assert_eq!(request.method(), "POST");
        assert_eq!(request.path(), "/form");
        assert_eq!(&request.body()[..], b"a=1");

        let empty = Request::new(5, HeaderBlock::new(), Bytes::new());
        assert_eq!(empty.path(), "");
    }
}
