//! Sans-IO HTTP/2 connection engine
//!
//! [`Connection`] consumes raw bytes with [`Connection::recv`], produces raw
//! bytes with [`Connection::take_output`] and reports what happened through
//! [`Connection::poll_event`]. It never touches a socket; the server module
//! wires it to a transport.
//!
//! Outbound frames go through a single ordered queue. Control frames
//! (SETTINGS, PING, RST_STREAM, GOAWAY, WINDOW_UPDATE) jump ahead of
//! everything else. Header blocks are HPACK-encoded when they are written,
//! so the encoder sees blocks in exactly the order the peer decodes them.
//! DATA is written as far as flow control allows; a stream that runs out
//! of credit is skipped, and frames queued behind it on the same stream
//! wait with it.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, ErrorScope, Result};
use super::flow_control::{FlowControlManager, WindowTarget};
use super::frame_logger::{Direction, FrameLogger};
use super::frames::{
    ContinuationFrame, DataFrame, Frame, GoawayFrame, HeadersFrame, PingFrame, PrioritySpec,
    PushPromiseFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
};
use super::hpack::{Decoder, Encoder, HeaderBlock};
use super::settings::Settings;
use super::stream::{Initiator, Role, StreamEvent, StreamId, StreamState, StreamTable};
use super::{CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE};
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, trace, warn};

/// Header block buffer cap, in frames, when no header list size is set
const MAX_BUFFERED_BLOCK_FRAMES: usize = 64;

/// Header fields that are not allowed in HTTP/2 messages
const CONNECTION_SPECIFIC_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Something the application needs to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A complete request arrived (server role)
    Request {
        stream_id: StreamId,
        headers: HeaderBlock,
        body: Bytes,
    },
    /// A complete response arrived, pushed ones included (client role)
    Response {
        stream_id: StreamId,
        headers: HeaderBlock,
        body: Bytes,
    },
    /// The server promised `promised_stream_id` on `stream_id` (client role)
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderBlock,
    },
    /// The stream ended without completing
    StreamAborted { stream_id: StreamId, code: ErrorCode },
    /// The peer is shutting the connection down
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
}

/// Frame waiting in the ordered outbound queue
#[derive(Debug)]
enum Queued {
    Headers {
        stream_id: StreamId,
        headers: HeaderBlock,
        end_stream: bool,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderBlock,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
}

impl Queued {
    /// Stream the frame is sent on
    fn stream_id(&self) -> StreamId {
        match self {
            Queued::Headers { stream_id, .. }
            | Queued::PushPromise { stream_id, .. }
            | Queued::Data { stream_id, .. } => *stream_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// Server waiting for the client preface; holds the bytes matched so far
    Preface(usize),
    /// Waiting for the peer's first SETTINGS
    Settings,
    Done,
}

#[derive(Debug)]
enum BlockKind {
    Headers {
        end_stream: bool,
        priority: Option<PrioritySpec>,
    },
    PushPromise {
        promised_stream_id: StreamId,
    },
}

/// Header block still waiting for END_HEADERS
#[derive(Debug)]
struct PendingBlock {
    stream_id: StreamId,
    kind: BlockKind,
    fragments: BytesMut,
}

/// One end of an HTTP/2 connection
#[derive(Debug)]
pub struct Connection {
    role: Role,
    handshake: Handshake,
    codec: FrameCodec,
    encoder: Encoder,
    decoder: Decoder,
    streams: StreamTable,
    flow: FlowControlManager,
    local_settings: Settings,
    remote_settings: Settings,
    /// One entry per SETTINGS awaiting ACK: a receive window reduction
    /// that takes effect when the peer acknowledges it
    unacked_settings: VecDeque<Option<u32>>,
    pending_block: Option<PendingBlock>,
    /// Control frames, written before anything in `queue`
    control: VecDeque<Frame>,
    queue: VecDeque<Queued>,
    output: BytesMut,
    events: VecDeque<ConnectionEvent>,
    goaway_sent: Option<StreamId>,
    goaway_received: Option<StreamId>,
    /// Set after a connection error or transport loss; input is ignored
    closed: bool,
    frame_logger: Option<FrameLogger>,
}

impl Connection {
    /// Server end; waits for the client preface
    pub fn server(settings: Settings) -> Self {
        Self::new(Role::Server, settings)
    }

    /// Client end; the preface is written immediately
    pub fn client(settings: Settings) -> Self {
        let mut conn = Self::new(Role::Client, settings);
        conn.output.extend_from_slice(CONNECTION_PREFACE);
        conn
    }

    fn new(role: Role, settings: Settings) -> Self {
        let mut streams = StreamTable::new(role);
        streams.set_remote_limit(settings.max_concurrent_streams());

        let mut decoder = Decoder::with_max_table_size(settings.header_table_size() as usize);
        decoder.set_max_header_list_size(settings.max_header_list_size().map(|n| n as usize));

        let mut control: VecDeque<Frame> = VecDeque::new();
        control.push_back(SettingsFrame::new(settings.clone()).into());

        Connection {
            role,
            handshake: match role {
                Role::Server => Handshake::Preface(0),
                Role::Client => Handshake::Settings,
            },
            codec: FrameCodec::with_max_frame_size(settings.max_frame_size()),
            encoder: Encoder::new(),
            decoder,
            streams,
            flow: FlowControlManager::new(
                DEFAULT_INITIAL_WINDOW_SIZE,
                settings.initial_window_size(),
            ),
            local_settings: settings,
            remote_settings: Settings::new(),
            unacked_settings: VecDeque::from([None]),
            pending_block: None,
            control,
            queue: VecDeque::new(),
            output: BytesMut::new(),
            events: VecDeque::new(),
            goaway_sent: None,
            goaway_received: None,
            closed: false,
            frame_logger: None,
        }
    }

    /// Log every frame read or written
    pub fn with_frame_logger(mut self, logger: FrameLogger) -> Self {
        self.frame_logger = Some(logger);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Settings we advertised (applied as soon as they are queued)
    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    /// Settings the peer advertised
    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// No more input will be processed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The connection has nothing left to do and the transport can go
    pub fn is_finished(&self) -> bool {
        self.closed
            || ((self.goaway_sent.is_some() || self.goaway_received.is_some())
                && self.streams.is_empty()
                && self.queue.is_empty())
    }

    /// Last stream id from a GOAWAY the peer sent
    pub fn goaway_received(&self) -> Option<StreamId> {
        self.goaway_received
    }

    /// Current state of a stream; `Closed` once it left the table
    pub fn stream_state(&self, stream_id: StreamId) -> StreamState {
        self.streams.state(stream_id)
    }

    /// Whether frames can still be sent on `stream_id`
    pub fn is_stream_writable(&self, stream_id: StreamId) -> bool {
        !self.closed && self.streams.state(stream_id).can_send()
    }

    /// Something is waiting to be written
    pub fn wants_write(&self) -> bool {
        !self.output.is_empty() || !self.control.is_empty() || !self.queue.is_empty()
    }

    /// Next event, oldest first
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Feed bytes read from the transport
    ///
    /// Stream errors are answered with RST_STREAM and processing goes on.
    /// A connection error queues GOAWAY, aborts every stream and is
    /// returned; later input is ignored.
    pub fn recv(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            trace!(len = bytes.len(), "ignoring input on closed connection");
            return Ok(());
        }

        let mut input = bytes;
        if let Handshake::Preface(matched) = self.handshake {
            let n = (CONNECTION_PREFACE.len() - matched).min(input.len());
            if input[..n] != CONNECTION_PREFACE[matched..matched + n] {
                return Err(self.fail_connection(Error::MissingPreface));
            }
            input = &input[n..];
            if matched + n < CONNECTION_PREFACE.len() {
                self.handshake = Handshake::Preface(matched + n);
                return Ok(());
            }
            debug!("client preface received");
            self.handshake = Handshake::Settings;
        }

        self.codec.feed(input);
        loop {
            let frame = match self.codec.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(self.fail_connection(e)),
            };
            if let Err(e) = self.handle_frame(frame) {
                match e.scope() {
                    ErrorScope::Stream(stream_id) => self.on_stream_error(stream_id, e),
                    _ => return Err(self.fail_connection(e)),
                }
            }
        }

        for (stream_id, increment) in self.flow.take_window_updates() {
            if stream_id == 0 || self.streams.state(stream_id).can_receive() {
                self.control
                    .push_back(WindowUpdateFrame::new(stream_id, increment).into());
            }
        }
        Ok(())
    }

    /// Bytes ready for the transport
    pub fn take_output(&mut self) -> Bytes {
        self.flush();
        self.output.split().freeze()
    }

    /// The transport is gone; every live stream is aborted with CANCEL
    pub fn transport_closed(&mut self) {
        if !self.closed {
            info!(role = ?self.role, "transport closed");
        }
        for stream_id in self.streams.drain() {
            self.flow.release_stream(stream_id);
            self.events.push_back(ConnectionEvent::StreamAborted {
                stream_id,
                code: ErrorCode::Cancel,
            });
        }
        self.queue.clear();
        self.control.clear();
        self.closed = true;
    }

    /// Queue response headers and an optional body on `stream_id`
    ///
    /// `end_stream` closes our side after the body (or after the headers
    /// when the body is empty). Writes to a stream that was reset are
    /// dropped silently.
    pub fn send_response(
        &mut self,
        stream_id: StreamId,
        headers: HeaderBlock,
        body: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        if !self.check_writable(stream_id)? {
            return Ok(());
        }
        let headers_end = end_stream && body.is_empty();
        self.streams
            .transition(stream_id, StreamEvent::SendHeaders { end_stream: headers_end })?;
        self.queue.push_back(Queued::Headers {
            stream_id,
            headers,
            end_stream: headers_end,
        });
        if !body.is_empty() {
            self.queue_data(stream_id, body, end_stream)?;
        }
        Ok(())
    }

    /// Queue DATA on a stream whose headers were already sent
    pub fn send_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        if !self.check_writable(stream_id)? {
            return Ok(());
        }
        if data.is_empty() && !end_stream {
            return Ok(());
        }
        self.queue_data(stream_id, data, end_stream)
    }

    /// Promise a response to `request_headers` on `parent`
    ///
    /// Queues PUSH_PROMISE on the parent followed by the pushed response,
    /// so the promise always reaches the peer before anything on the
    /// promised stream. Returns `None` when the peer does not accept
    /// pushes right now.
    pub fn push_promise(
        &mut self,
        parent: StreamId,
        request_headers: HeaderBlock,
        response_headers: HeaderBlock,
        body: Bytes,
    ) -> Result<Option<StreamId>> {
        if self.role != Role::Server {
            return Err(Error::Protocol("only servers push".into()));
        }
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if !self.remote_settings.enable_push() {
            debug!(parent, "push disabled by peer");
            return Ok(None);
        }
        if self.goaway_sent.is_some() || self.goaway_received.is_some() {
            debug!(parent, "no pushes after GOAWAY");
            return Ok(None);
        }
        if self.streams.was_reset(parent) {
            return Ok(None);
        }
        match self.streams.get(parent) {
            Some(s) if s.initiator() == Initiator::Remote && s.state().can_send() => {}
            _ => return Err(Error::StreamClosed(parent)),
        }

        let promised = self.streams.allocate_local_id()?;
        match self.streams.create(promised, Initiator::Local) {
            Ok(stream) => stream.set_request_headers(request_headers.clone()),
            Err(Error::StreamLimitExceeded(_)) => {
                debug!(parent, "peer stream limit reached, not pushing");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        self.flow.open_stream(promised);
        self.streams
            .transition(promised, StreamEvent::SendPushPromise)?;
        self.queue.push_back(Queued::PushPromise {
            stream_id: parent,
            promised_stream_id: promised,
            headers: request_headers,
        });

        let headers_end = body.is_empty();
        self.streams
            .transition(promised, StreamEvent::SendHeaders { end_stream: headers_end })?;
        self.queue.push_back(Queued::Headers {
            stream_id: promised,
            headers: response_headers,
            end_stream: headers_end,
        });
        if !body.is_empty() {
            self.queue_data(promised, body, true)?;
        }

        debug!(parent, promised, "push promised");
        Ok(Some(promised))
    }

    /// Open a request stream (client role)
    pub fn open_stream(&mut self, headers: HeaderBlock, body: Bytes) -> Result<StreamId> {
        if self.role != Role::Client {
            return Err(Error::Protocol("only clients open request streams".into()));
        }
        if self.closed || self.goaway_received.is_some() {
            return Err(Error::ConnectionClosed);
        }

        let stream_id = self.streams.allocate_local_id()?;
        self.streams.create(stream_id, Initiator::Local)?;
        self.flow.open_stream(stream_id);

        let headers_end = body.is_empty();
        self.streams
            .transition(stream_id, StreamEvent::SendHeaders { end_stream: headers_end })?;
        self.queue.push_back(Queued::Headers {
            stream_id,
            headers,
            end_stream: headers_end,
        });
        if !body.is_empty() {
            self.queue_data(stream_id, body, true)?;
        }
        Ok(stream_id)
    }

    /// Abandon a stream with RST_STREAM
    pub fn reset_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        if self.streams.contains(stream_id) {
            debug!(stream_id, %code, "resetting stream");
            self.send_reset(stream_id, code);
        }
    }

    /// Queue GOAWAY naming the highest stream the peer opened
    ///
    /// Streams up to that id keep running; newer ones from the peer are
    /// ignored.
    pub fn go_away(&mut self, code: ErrorCode, debug_data: &str) {
        let last_stream_id = self.streams.highest_remote_id();
        info!(last_stream_id, %code, "sending GOAWAY");
        self.goaway_sent = Some(last_stream_id);
        self.control.push_back(
            GoawayFrame::new(
                last_stream_id,
                code,
                Bytes::copy_from_slice(debug_data.as_bytes()),
            )
            .into(),
        );
    }

    /// Change our settings mid-connection
    pub fn update_local_settings(&mut self, settings: Settings) -> Result<()> {
        settings.validate()?;
        if let Some(size) = settings.header_table_size {
            self.decoder.set_max_table_size(size as usize);
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.streams.set_remote_limit(Some(max));
        }
        // The peer may still be sending under the old window until it
        // acknowledges, so only increases apply right away
        let mut shrink = None;
        if let Some(size) = settings.initial_window_size {
            if size >= self.flow.initial_recv_window() {
                self.flow.set_initial_recv_window(size)?;
                self.unacked_settings.iter_mut().for_each(|pending| *pending = None);
            } else {
                shrink = Some(size);
            }
        }
        if let Some(size) = settings.max_frame_size {
            self.codec.set_max_frame_size(size);
        }
        if let Some(size) = settings.max_header_list_size {
            self.decoder.set_max_header_list_size(Some(size as usize));
        }

        self.local_settings.merge(&settings);
        self.control.push_back(SettingsFrame::new(settings).into());
        self.unacked_settings.push_back(shrink);
        Ok(())
    }

    pub fn ping(&mut self, data: [u8; 8]) {
        self.control.push_back(PingFrame::new(data).into());
    }

    fn check_writable(&self, stream_id: StreamId) -> Result<bool> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.streams.was_reset(stream_id) {
            debug!(stream_id, "dropping write to reset stream");
            return Ok(false);
        }
        if self.streams.state(stream_id).can_send() {
            Ok(true)
        } else {
            Err(Error::StreamClosed(stream_id))
        }
    }

    fn queue_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        self.streams
            .transition(stream_id, StreamEvent::SendData { end_stream })?;
        self.queue.push_back(Queued::Data {
            stream_id,
            data,
            end_stream,
        });
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        if let Some(logger) = &self.frame_logger {
            logger.log(Direction::Inbound, &frame);
        }

        if self.handshake == Handshake::Settings {
            match &frame {
                Frame::Settings(s) if !s.ack => {
                    self.handshake = Handshake::Done;
                    info!(role = ?self.role, "connection established");
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected SETTINGS as first frame, got {}",
                        other.name()
                    )))
                }
            }
        }

        if let Some(pending) = &self.pending_block {
            let continues = matches!(&frame, Frame::Continuation(c) if c.stream_id == pending.stream_id);
            if !continues {
                return Err(Error::Protocol(format!(
                    "{} on stream {} while header block on stream {} is open",
                    frame.name(),
                    frame.stream_id(),
                    pending.stream_id
                )));
            }
        }

        match frame {
            Frame::Data(f) => self.on_data(f),
            Frame::Headers(f) => {
                let kind = BlockKind::Headers {
                    end_stream: f.end_stream,
                    priority: f.priority,
                };
                self.start_block(f.stream_id, kind, f.header_block, f.end_headers)
            }
            Frame::Priority(f) => {
                check_priority(f.stream_id, &f.priority)?;
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.set_priority(f.priority);
                }
                Ok(())
            }
            Frame::RstStream(f) => self.on_rst_stream(f),
            Frame::Settings(f) => self.on_settings(f),
            Frame::PushPromise(f) => {
                if self.role == Role::Server {
                    return Err(Error::Protocol("client sent PUSH_PROMISE".into()));
                }
                if !self.local_settings.enable_push() {
                    return Err(Error::Protocol("PUSH_PROMISE with push disabled".into()));
                }
                let kind = BlockKind::PushPromise {
                    promised_stream_id: f.promised_stream_id,
                };
                self.start_block(f.stream_id, kind, f.header_block, f.end_headers)
            }
            Frame::Ping(f) => {
                if !f.ack {
                    self.control.push_back(PingFrame::ack(f.data).into());
                }
                Ok(())
            }
            Frame::Goaway(f) => {
                self.on_goaway(f);
                Ok(())
            }
            Frame::WindowUpdate(f) => {
                let target = WindowTarget::from_stream_id(f.stream_id);
                if let WindowTarget::Stream(id) = target {
                    if self.streams.is_idle(id) {
                        return Err(Error::Protocol(format!(
                            "WINDOW_UPDATE on idle stream {}",
                            id
                        )));
                    }
                }
                self.flow.apply_window_update(target, f.size_increment)
            }
            Frame::Continuation(f) => {
                let mut pending = self.pending_block.take().ok_or_else(|| {
                    Error::Protocol(format!("unexpected CONTINUATION on stream {}", f.stream_id))
                })?;
                let buffered = pending.fragments.len() + f.header_block.len();
                if buffered > self.header_block_limit() {
                    return Err(Error::HeaderBlockTooLarge(buffered));
                }
                pending.fragments.extend_from_slice(&f.header_block);
                if f.end_headers {
                    self.on_header_block(pending.stream_id, pending.kind, &pending.fragments)
                } else {
                    self.pending_block = Some(pending);
                    Ok(())
                }
            }
            Frame::Unknown(f) => {
                trace!(frame_type = f.frame_type, "ignoring unknown frame");
                Ok(())
            }
        }
    }

    fn start_block(
        &mut self,
        stream_id: StreamId,
        kind: BlockKind,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<()> {
        if end_headers {
            return self.on_header_block(stream_id, kind, &fragment);
        }
        if fragment.len() > self.header_block_limit() {
            return Err(Error::HeaderBlockTooLarge(fragment.len()));
        }
        self.pending_block = Some(PendingBlock {
            stream_id,
            kind,
            fragments: BytesMut::from(&fragment[..]),
        });
        Ok(())
    }

    /// Most header block bytes buffered while waiting for END_HEADERS
    fn header_block_limit(&self) -> usize {
        match self.local_settings.max_header_list_size() {
            Some(size) => size as usize,
            None => MAX_BUFFERED_BLOCK_FRAMES * self.local_settings.max_frame_size() as usize,
        }
    }

    /// A complete header block arrived
    fn on_header_block(&mut self, stream_id: StreamId, kind: BlockKind, block: &[u8]) -> Result<()> {
        // Decode before anything else so the HPACK context stays in step
        // even when the stream itself is rejected.
        let (headers, malformed) = match self.decoder.decode(block) {
            Ok(headers) => (headers, None),
            Err(Error::MalformedField(reason)) => (HeaderBlock::new(), Some(reason)),
            Err(e) => return Err(e),
        };
        match kind {
            BlockKind::Headers {
                end_stream,
                priority,
            } => self.on_headers(stream_id, headers, malformed, end_stream, priority),
            BlockKind::PushPromise { promised_stream_id } => {
                self.on_push_promise(stream_id, promised_stream_id, headers, malformed)
            }
        }
    }

    fn on_headers(
        &mut self,
        stream_id: StreamId,
        headers: HeaderBlock,
        malformed: Option<String>,
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) -> Result<()> {
        if self.streams.was_reset(stream_id) {
            trace!(stream_id, "dropping HEADERS for reset stream");
            return Ok(());
        }

        if self.streams.is_idle(stream_id) {
            if self.role == Role::Client {
                return Err(Error::Protocol(format!(
                    "server opened stream {} with HEADERS",
                    stream_id
                )));
            }
            if let Some(last) = self.goaway_sent {
                if stream_id > last {
                    debug!(stream_id, last, "ignoring stream opened after GOAWAY");
                    return Ok(());
                }
            }
            self.streams.create(stream_id, Initiator::Remote)?;
            self.flow.open_stream(stream_id);
            debug!(stream_id, "stream opened by peer");

            let verdict = match malformed {
                Some(reason) => Err(reason),
                None => check_request_headers(&headers),
            };
            if let Err(reason) = verdict {
                // Never handed to the application, so no StreamAborted
                debug!(stream_id, %reason, "rejecting malformed request");
                self.send_reset(stream_id, ErrorCode::ProtocolError);
                return Ok(());
            }
        } else if let Some(reason) = malformed {
            return Err(Error::stream(stream_id, ErrorCode::ProtocolError, reason));
        }
        if let Some(priority) = &priority {
            check_priority(stream_id, priority)?;
        }

        let informational = self.role == Role::Client
            && headers.status().map_or(false, |s| (100..200).contains(&s));
        if let Some(stream) = self.streams.get_mut(stream_id) {
            if let Some(priority) = priority {
                stream.set_priority(priority);
            }
            // A second block on a stream is a trailer; trailers are dropped
            if !informational && stream.received_headers().is_none() {
                stream.set_received_headers(headers);
            }
        }

        let message = if end_stream {
            self.streams
                .get_mut(stream_id)
                .map(|s| (s.take_received_headers(), s.take_body()))
        } else {
            None
        };
        let state = self
            .streams
            .transition(stream_id, StreamEvent::RecvHeaders { end_stream })?;
        if let Some((headers, body)) = message {
            self.deliver(stream_id, headers, body);
        }
        if state.is_closed() {
            self.release_if_done(stream_id);
        }
        Ok(())
    }

    fn on_push_promise(
        &mut self,
        parent: StreamId,
        promised: StreamId,
        headers: HeaderBlock,
        malformed: Option<String>,
    ) -> Result<()> {
        let parent_state = self.streams.state(parent);
        let parent_reset = self.streams.was_reset(parent);
        if !parent_reset
            && !matches!(parent_state, StreamState::Open | StreamState::HalfClosedLocal)
        {
            return Err(Error::Protocol(format!(
                "PUSH_PROMISE on stream {} in state {:?}",
                parent, parent_state
            )));
        }

        self.streams.create(promised, Initiator::Remote)?;
        if parent_reset {
            debug!(parent, promised, "refusing push on reset stream");
            self.send_reset(promised, ErrorCode::Cancel);
            return Ok(());
        }
        if let Some(reason) = malformed {
            debug!(parent, promised, %reason, "refusing malformed push");
            self.send_reset(promised, ErrorCode::ProtocolError);
            return Ok(());
        }

        self.flow.open_stream(promised);
        self.streams
            .transition(promised, StreamEvent::RecvPushPromise)?;
        if let Some(stream) = self.streams.get_mut(promised) {
            stream.set_request_headers(headers.clone());
        }
        debug!(parent, promised, "push promise received");
        self.events.push_back(ConnectionEvent::PushPromise {
            stream_id: parent,
            promised_stream_id: promised,
            headers,
        });
        Ok(())
    }

    fn on_data(&mut self, f: DataFrame) -> Result<()> {
        let stream_id = f.stream_id;
        // Counted against the connection window even if the stream is gone
        self.flow.consume_recv(stream_id, f.flow_controlled_len())?;

        if self.streams.was_reset(stream_id) {
            trace!(stream_id, "dropping DATA for reset stream");
            return Ok(());
        }
        if self.streams.is_idle(stream_id) {
            return Err(Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "DATA on idle stream",
            ));
        }

        let message = match self.streams.get_mut(stream_id) {
            Some(stream) if stream.state().can_receive() => {
                stream.append_body(&f.data);
                if f.end_stream {
                    Some((stream.take_received_headers(), stream.take_body()))
                } else {
                    None
                }
            }
            _ => None,
        };
        let state = self.streams.transition(
            stream_id,
            StreamEvent::RecvData {
                end_stream: f.end_stream,
            },
        )?;
        if let Some((headers, body)) = message {
            self.deliver(stream_id, headers, body);
        }
        if state.is_closed() {
            self.release_if_done(stream_id);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, f: RstStreamFrame) -> Result<()> {
        let stream_id = f.stream_id;
        if self.streams.is_idle(stream_id) {
            return Err(Error::Protocol(format!(
                "RST_STREAM on idle stream {}",
                stream_id
            )));
        }
        if self.streams.contains(stream_id) {
            debug!(stream_id, code = %f.error_code, "stream reset by peer");
            self.streams.transition(stream_id, StreamEvent::RecvReset)?;
            self.purge(stream_id);
            self.flow.release_stream(stream_id);
            self.events.push_back(ConnectionEvent::StreamAborted {
                stream_id,
                code: f.error_code,
            });
        }
        Ok(())
    }

    fn on_settings(&mut self, f: SettingsFrame) -> Result<()> {
        if f.ack {
            match self.unacked_settings.pop_front() {
                None => warn!("unsolicited SETTINGS acknowledgement"),
                Some(Some(size)) => {
                    debug!(size, "peer acknowledged smaller initial window");
                    self.flow.set_initial_recv_window(size)?;
                }
                Some(None) => {}
            }
            return Ok(());
        }

        let settings = &f.settings;
        if let Some(size) = settings.header_table_size {
            // Our encoder never needs more than the default table
            let size = size.min(DEFAULT_HEADER_TABLE_SIZE) as usize;
            if size != self.encoder.table().max_size() {
                self.encoder.set_max_table_size(size);
            }
        }
        if let Some(max) = settings.max_concurrent_streams {
            self.streams.set_local_limit(Some(max));
        }
        if let Some(size) = settings.initial_window_size {
            self.flow.set_initial_send_window(size)?;
        }
        self.remote_settings.merge(settings);
        debug!(?settings, "peer settings applied");

        self.control.push_back(SettingsFrame::ack().into());
        Ok(())
    }

    fn on_goaway(&mut self, f: GoawayFrame) {
        info!(
            last_stream_id = f.last_stream_id,
            code = %f.error_code,
            debug = %String::from_utf8_lossy(&f.debug_data),
            "GOAWAY received"
        );
        self.goaway_received = Some(f.last_stream_id);

        // Our streams above the last id were never processed by the peer
        let unprocessed: Vec<StreamId> = self
            .streams
            .stream_ids()
            .into_iter()
            .filter(|&id| self.role.owns(id) && id > f.last_stream_id)
            .collect();
        for stream_id in unprocessed {
            self.streams.reset(stream_id);
            self.purge(stream_id);
            self.flow.release_stream(stream_id);
            self.events.push_back(ConnectionEvent::StreamAborted {
                stream_id,
                code: ErrorCode::RefusedStream,
            });
        }

        self.events.push_back(ConnectionEvent::GoAway {
            last_stream_id: f.last_stream_id,
            code: f.error_code,
            debug_data: f.debug_data,
        });
    }

    fn deliver(&mut self, stream_id: StreamId, headers: HeaderBlock, body: Bytes) {
        let event = match self.role {
            Role::Server => ConnectionEvent::Request {
                stream_id,
                headers,
                body,
            },
            Role::Client => ConnectionEvent::Response {
                stream_id,
                headers,
                body,
            },
        };
        self.events.push_back(event);
    }

    fn on_stream_error(&mut self, stream_id: StreamId, error: Error) {
        let code = error.code();
        debug!(stream_id, %code, %error, "stream error");
        if self.send_reset(stream_id, code) {
            self.events
                .push_back(ConnectionEvent::StreamAborted { stream_id, code });
        }
    }

    /// Queue GOAWAY for a connection error and stop processing input
    fn fail_connection(&mut self, error: Error) -> Error {
        let code = error.code();
        warn!(%error, %code, "connection error");
        if !self.closed {
            let last_stream_id = self.streams.highest_remote_id();
            self.queue.clear();
            self.control.push_back(
                GoawayFrame::new(last_stream_id, code, Bytes::from(error.to_string())).into(),
            );
            self.goaway_sent = Some(last_stream_id);
            for stream_id in self.streams.drain() {
                self.flow.release_stream(stream_id);
                self.events
                    .push_back(ConnectionEvent::StreamAborted { stream_id, code });
            }
            self.closed = true;
        }
        error
    }

    /// Reset a stream and queue RST_STREAM; returns whether it was live
    fn send_reset(&mut self, stream_id: StreamId, code: ErrorCode) -> bool {
        let existed = self.streams.reset(stream_id);
        self.purge(stream_id);
        self.flow.release_stream(stream_id);
        self.control
            .push_back(RstStreamFrame::new(stream_id, code).into());
        existed
    }

    /// Drop queued frames of a stream
    ///
    /// Promises queued on it will never reach the peer, so their streams
    /// are dropped as well.
    fn purge(&mut self, stream_id: StreamId) {
        let mut orphans = Vec::new();
        self.queue.retain(|item| match item {
            Queued::PushPromise {
                stream_id: parent,
                promised_stream_id,
                ..
            } if *parent == stream_id => {
                orphans.push(*promised_stream_id);
                false
            }
            other => other.stream_id() != stream_id,
        });

        for promised in orphans {
            debug!(stream_id, promised, "dropping unsent push");
            self.streams.reset(promised);
            self.flow.release_stream(promised);
            self.queue.retain(|item| item.stream_id() != promised);
            self.events.push_back(ConnectionEvent::StreamAborted {
                stream_id: promised,
                code: ErrorCode::Cancel,
            });
        }
    }

    /// Drop the windows of a closed stream once nothing of it is queued
    fn release_if_done(&mut self, stream_id: StreamId) {
        if !self.streams.contains(stream_id)
            && !self.queue.iter().any(|item| item.stream_id() == stream_id)
        {
            self.flow.release_stream(stream_id);
        }
    }

    fn flush(&mut self) {
        while let Some(frame) = self.control.pop_front() {
            self.write_frame(frame);
        }
        if self.queue.is_empty() {
            return;
        }

        let max_frame = self.remote_settings.max_frame_size() as usize;
        let mut blocked: HashSet<StreamId> = HashSet::new();
        let mut deferred = VecDeque::new();
        let mut finished = Vec::new();

        while let Some(item) = self.queue.pop_front() {
            if blocked.contains(&item.stream_id()) {
                if let Queued::PushPromise {
                    promised_stream_id, ..
                } = &item
                {
                    blocked.insert(*promised_stream_id);
                }
                deferred.push_back(item);
                continue;
            }

            match item {
                Queued::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    let block = self.encoder.encode(&headers);
                    self.write_header_block(stream_id, None, end_stream, block, max_frame);
                    if end_stream {
                        finished.push(stream_id);
                    }
                }
                Queued::PushPromise {
                    stream_id,
                    promised_stream_id,
                    headers,
                } => {
                    let block = self.encoder.encode(&headers);
                    self.write_header_block(
                        stream_id,
                        Some(promised_stream_id),
                        false,
                        block,
                        max_frame,
                    );
                }
                Queued::Data {
                    stream_id,
                    data,
                    end_stream,
                } => match self.write_data(stream_id, data, end_stream, max_frame) {
                    Some(rest) => {
                        trace!(stream_id, remaining = rest.len(), "stream blocked on flow control");
                        blocked.insert(stream_id);
                        deferred.push_back(Queued::Data {
                            stream_id,
                            data: rest,
                            end_stream,
                        });
                    }
                    None => {
                        if end_stream {
                            finished.push(stream_id);
                        }
                    }
                },
            }
        }

        self.queue = deferred;
        for stream_id in finished {
            self.release_if_done(stream_id);
        }
    }

    /// Write HEADERS or PUSH_PROMISE, splitting into CONTINUATION frames
    fn write_header_block(
        &mut self,
        stream_id: StreamId,
        promised: Option<StreamId>,
        end_stream: bool,
        mut block: Bytes,
        max_frame: usize,
    ) {
        // PUSH_PROMISE spends four payload bytes on the promised id
        let room = if promised.is_some() { max_frame - 4 } else { max_frame };
        let fragment = block.split_to(block.len().min(room));
        let end_headers = block.is_empty();
        let first = match promised {
            Some(promised) => {
                PushPromiseFrame::new(stream_id, promised, fragment, end_headers).into()
            }
            None => HeadersFrame::new(stream_id, fragment, end_stream, end_headers).into(),
        };
        self.write_frame(first);

        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max_frame));
            self.write_frame(Frame::Continuation(ContinuationFrame {
                stream_id,
                header_block: fragment,
                end_headers: block.is_empty(),
            }));
        }
    }

    /// Write as much of `data` as flow control allows; returns the rest
    fn write_data(
        &mut self,
        stream_id: StreamId,
        mut data: Bytes,
        end_stream: bool,
        max_frame: usize,
    ) -> Option<Bytes> {
        if data.is_empty() {
            self.write_frame(DataFrame::new(stream_id, data, end_stream).into());
            return None;
        }
        while !data.is_empty() {
            let granted = self
                .flow
                .reserve_send_credit(stream_id, data.len().min(max_frame));
            if granted == 0 {
                return Some(data);
            }
            let chunk = data.split_to(granted);
            let last = end_stream && data.is_empty();
            self.write_frame(DataFrame::new(stream_id, chunk, last).into());
        }
        None
    }

    fn write_frame(&mut self, frame: Frame) {
        if let Some(logger) = &self.frame_logger {
            logger.log(Direction::Outbound, &frame);
        }
        self.output.extend_from_slice(&FrameCodec::encode(&frame));
    }
}

fn check_priority(stream_id: StreamId, priority: &PrioritySpec) -> Result<()> {
    if priority.stream_dependency == stream_id {
        return Err(Error::stream(
            stream_id,
            ErrorCode::ProtocolError,
            "stream depends on itself",
        ));
    }
    Ok(())
}

/// Reject malformed requests (RFC 7540 Section 8.1.2)
fn check_request_headers(headers: &HeaderBlock) -> std::result::Result<(), String> {
    let mut seen_regular = false;
    for field in headers {
        if field.is_pseudo() {
            if seen_regular {
                return Err(format!("pseudo-header {} after regular header", field.name));
            }
            continue;
        }
        seen_regular = true;
        if field.name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(format!("uppercase header name {}", field.name));
        }
        if CONNECTION_SPECIFIC_HEADERS.contains(&field.name.as_str()) {
            return Err(format!("connection-specific header {}", field.name));
        }
    }

    match headers.method() {
        None => Err("missing :method".into()),
        Some("CONNECT") if headers.authority().is_none() => Err("CONNECT without :authority".into()),
        Some("CONNECT") => Ok(()),
        Some(_) if headers.scheme().is_none() => Err("missing :scheme".into()),
        Some(_) if headers.path().map_or(true, str::is_empty) => Err("missing :path".into()),
        Some(_) => Ok(()),
    }
}
