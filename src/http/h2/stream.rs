//! HTTP/2 stream management
//!
//! This module implements the stream lifecycle of RFC 7540 Section 5.1.
//! The [`StreamTable`] owns every live [`Stream`] of a connection, hands
//! out local stream ids, enforces SETTINGS_MAX_CONCURRENT_STREAMS and
//! applies [`StreamEvent`]s to the state machine.

use super::error::{Error, ErrorCode, Result};
use super::frames::PrioritySpec;
use super::hpack::HeaderBlock;
use super::MAX_STREAM_ID;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Stream ID type
pub type StreamId = u32;

/// How many reset stream ids are remembered
const RECENTLY_RESET_CAPACITY: usize = 256;

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Whether `id` has the parity of streams this role opens
    pub fn owns(self, id: StreamId) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }

    fn first_local_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Which end opened a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Reserved (local): PUSH_PROMISE sent
    ReservedLocal,
    /// Reserved (remote): PUSH_PROMISE received
    ReservedRemote,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }

    /// Counts against SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }
}

/// Something that happens to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    SendHeaders { end_stream: bool },
    RecvHeaders { end_stream: bool },
    SendData { end_stream: bool },
    RecvData { end_stream: bool },
    /// PUSH_PROMISE naming this stream as the promised one
    SendPushPromise,
    RecvPushPromise,
    SendReset,
    RecvReset,
}

impl StreamEvent {
    fn is_reset(self) -> bool {
        matches!(self, StreamEvent::SendReset | StreamEvent::RecvReset)
    }
}

/// Apply `event` to `state`, or say which error code the event earns
fn next_state(state: StreamState, event: StreamEvent) -> std::result::Result<StreamState, ErrorCode> {
    use StreamEvent::*;
    use StreamState::*;

    let closed_after = |end_stream: bool, half: StreamState, full: StreamState| {
        if end_stream {
            full
        } else {
            half
        }
    };

    match (state, event) {
        (Closed, RecvHeaders { .. } | RecvData { .. }) => Err(ErrorCode::StreamClosed),
        (Closed, _) => Err(ErrorCode::ProtocolError),
        (Idle, SendReset | RecvReset) => Err(ErrorCode::ProtocolError),
        (_, SendReset | RecvReset) => Ok(Closed),

        (Idle, SendHeaders { end_stream }) => Ok(closed_after(end_stream, Open, HalfClosedLocal)),
        (Idle, RecvHeaders { end_stream }) => Ok(closed_after(end_stream, Open, HalfClosedRemote)),
        (Idle, SendPushPromise) => Ok(ReservedLocal),
        (Idle, RecvPushPromise) => Ok(ReservedRemote),

        (ReservedLocal, SendHeaders { end_stream }) => {
            Ok(closed_after(end_stream, HalfClosedRemote, Closed))
        }
        (ReservedRemote, RecvHeaders { end_stream }) => {
            Ok(closed_after(end_stream, HalfClosedLocal, Closed))
        }

        (Open, SendHeaders { end_stream } | SendData { end_stream }) => {
            Ok(closed_after(end_stream, Open, HalfClosedLocal))
        }
        (Open, RecvHeaders { end_stream } | RecvData { end_stream }) => {
            Ok(closed_after(end_stream, Open, HalfClosedRemote))
        }

        (HalfClosedLocal, RecvHeaders { end_stream } | RecvData { end_stream }) => {
            Ok(closed_after(end_stream, HalfClosedLocal, Closed))
        }
        (HalfClosedRemote, SendHeaders { end_stream } | SendData { end_stream }) => {
            Ok(closed_after(end_stream, HalfClosedRemote, Closed))
        }
        (HalfClosedRemote, RecvHeaders { .. } | RecvData { .. }) => Err(ErrorCode::StreamClosed),

        _ => Err(ErrorCode::ProtocolError),
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct Stream {
    /// Stream ID
    id: StreamId,
    /// Stream state
    state: StreamState,
    initiator: Initiator,
    /// Priority information
    priority: PrioritySpec,
    /// Decoded HEADERS awaiting END_STREAM
    received_headers: Option<HeaderBlock>,
    /// Accumulated body data
    body: BytesMut,
    /// Request a pushed stream answers (set from its PUSH_PROMISE)
    request_headers: Option<HeaderBlock>,
}

impl Stream {
    /// Create a new idle stream
    pub fn new(id: StreamId, initiator: Initiator) -> Self {
        Stream {
            id,
            state: StreamState::Idle,
            initiator,
            priority: PrioritySpec::default(),
            received_headers: None,
            body: BytesMut::new(),
            request_headers: None,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn initiator(&self) -> Initiator {
        self.initiator
    }

    /// Get priority
    pub fn priority(&self) -> PrioritySpec {
        self.priority
    }

    /// Set priority
    pub fn set_priority(&mut self, priority: PrioritySpec) {
        self.priority = priority;
    }

    pub fn received_headers(&self) -> Option<&HeaderBlock> {
        self.received_headers.as_ref()
    }

    pub fn set_received_headers(&mut self, headers: HeaderBlock) {
        self.received_headers = Some(headers);
    }

    /// Take the received headers, leaving an empty block
    pub fn take_received_headers(&mut self) -> HeaderBlock {
        self.received_headers.take().unwrap_or_default()
    }

    /// Append received DATA
    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Get accumulated body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take body (consumes the body data)
    pub fn take_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    pub fn request_headers(&self) -> Option<&HeaderBlock> {
        self.request_headers.as_ref()
    }

    pub fn set_request_headers(&mut self, headers: HeaderBlock) {
        self.request_headers = Some(headers);
    }
}

/// Stream table
///
/// Owns all streams of one connection, keyed by id.
#[derive(Debug)]
pub struct StreamTable {
    role: Role,
    /// Live streams
    streams: HashMap<StreamId, Stream>,
    /// Next stream ID we hand out (client: odd, server: even)
    next_local_id: StreamId,
    highest_local_id: StreamId,
    highest_remote_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS (bounds streams we open)
    max_local: Option<u32>,
    /// Our SETTINGS_MAX_CONCURRENT_STREAMS (bounds streams the peer opens)
    max_remote: Option<u32>,
    recently_reset: VecDeque<StreamId>,
}

impl StreamTable {
    /// Create an empty table for one end of a connection
    pub fn new(role: Role) -> Self {
        StreamTable {
            role,
            streams: HashMap::new(),
            next_local_id: role.first_local_id(),
            highest_local_id: 0,
            highest_remote_id: 0,
            max_local: None,
            max_remote: None,
            recently_reset: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Limit on streams we open (from the peer's SETTINGS)
    pub fn set_local_limit(&mut self, max: Option<u32>) {
        self.max_local = max;
    }

    /// Limit on streams the peer opens (from our SETTINGS)
    pub fn set_remote_limit(&mut self, max: Option<u32>) {
        self.max_remote = max;
    }

    /// Hand out the next id of our parity
    pub fn allocate_local_id(&mut self) -> Result<StreamId> {
        let id = self.next_local_id;
        if id > MAX_STREAM_ID {
            return Err(Error::Protocol("stream ids exhausted".into()));
        }
        self.next_local_id += 2;
        Ok(id)
    }

    /// Register a new idle stream
    ///
    /// Remote ids must have the peer's parity and grow monotonically; an id
    /// refused for exceeding the concurrency limit is still consumed.
    pub fn create(&mut self, id: StreamId, initiator: Initiator) -> Result<&mut Stream> {
        let ours = self.role.owns(id);
        let (expect_ours, highest, limit) = match initiator {
            Initiator::Local => (true, &mut self.highest_local_id, self.max_local),
            Initiator::Remote => (false, &mut self.highest_remote_id, self.max_remote),
        };

        if id == 0 || ours != expect_ours {
            return Err(Error::Protocol(format!(
                "stream {} has the wrong parity for a {:?} stream",
                id, initiator
            )));
        }
        if id <= *highest {
            return Err(Error::Protocol(format!(
                "stream {} is not above {}",
                id, *highest
            )));
        }
        *highest = id;

        if let Some(max) = limit {
            if self.active_count(initiator) >= max as usize {
                debug!(stream_id = id, max, "refusing stream over concurrency limit");
                return Err(Error::StreamLimitExceeded(id));
            }
        }

        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, initiator)))
    }

    /// Apply an event and return the resulting state
    ///
    /// A stream that reaches `Closed` is removed; reset ids are remembered
    /// so late frames for them can be dropped.
    pub fn transition(&mut self, id: StreamId, event: StreamEvent) -> Result<StreamState> {
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => {
                let code = if self.is_idle(id) {
                    ErrorCode::ProtocolError
                } else {
                    ErrorCode::StreamClosed
                };
                return Err(Error::stream(id, code, format!("{:?} on inactive stream", event)));
            }
        };

        let from = stream.state;
        let to = next_state(from, event).map_err(|code| {
            Error::stream(id, code, format!("{:?} not allowed in {:?}", event, from))
        })?;
        stream.state = to;
        debug!(stream_id = id, ?from, ?to, ?event, "stream transition");

        if to.is_closed() {
            self.streams.remove(&id);
            if event.is_reset() {
                self.remember_reset(id);
            }
        }
        Ok(to)
    }

    /// Drop a stream in whatever state it is and remember the reset
    ///
    /// Returns whether the stream was in the table.
    pub fn reset(&mut self, id: StreamId) -> bool {
        let existed = self.streams.remove(&id).is_some();
        self.remember_reset(id);
        existed
    }

    /// Record a reset of a stream that may not be in the table
    pub fn remember_reset(&mut self, id: StreamId) {
        if self.recently_reset.contains(&id) {
            return;
        }
        if self.recently_reset.len() == RECENTLY_RESET_CAPACITY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
    }

    /// Whether `id` was reset recently
    pub fn was_reset(&self, id: StreamId) -> bool {
        self.recently_reset.contains(&id)
    }

    /// Whether `id` has never been used
    pub fn is_idle(&self, id: StreamId) -> bool {
        if self.streams.contains_key(&id) {
            return false;
        }
        if self.role.owns(id) {
            id > self.highest_local_id
        } else {
            id > self.highest_remote_id
        }
    }

    /// Get a stream by ID
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Get a mutable stream by ID
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Current state, `Closed` for streams no longer in the table
    pub fn state(&self, id: StreamId) -> StreamState {
        match self.streams.get(&id) {
            Some(stream) => stream.state,
            None if self.is_idle(id) => StreamState::Idle,
            None => StreamState::Closed,
        }
    }

    /// Number of active streams opened by `initiator`
    pub fn active_count(&self, initiator: Initiator) -> usize {
        self.streams
            .values()
            .filter(|s| s.initiator == initiator && s.state.is_active())
            .count()
    }

    /// Largest stream id the peer has opened
    pub fn highest_remote_id(&self) -> StreamId {
        self.highest_remote_id
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Get all stream IDs, lowest first
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every stream, returning their ids lowest first
    pub fn drain(&mut self) -> Vec<StreamId> {
        let ids = self.stream_ids();
        self.streams.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_stream_error(result: Result<StreamState>, expected: ErrorCode) {
        match result {
            Err(Error::Stream { code, .. }) => assert_eq!(code, expected),
            other => panic!("expected stream error {:?}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_request_lifecycle() {
        let mut table = StreamTable::new(Role::Server);
        table.create(1, Initiator::Remote).unwrap();

        let state = table.transition(1, StreamEvent::RecvHeaders { end_stream: true }).unwrap();
        assert_eq!(state, StreamState::HalfClosedRemote);

        let state = table.transition(1, StreamEvent::SendHeaders { end_stream: false }).unwrap();
        assert_eq!(state, StreamState::HalfClosedRemote);

        let state = table.transition(1, StreamEvent::SendData { end_stream: true }).unwrap();
        assert_eq!(state, StreamState::Closed);
        assert!(!table.contains(1));
        assert_eq!(table.state(1), StreamState::Closed);
        assert!(!table.was_reset(1));
    }

    #[test]
    fn test_push_lifecycle() {
        let mut table = StreamTable::new(Role::Server);
        let id = table.allocate_local_id().unwrap();
        assert_eq!(id, 2);
        table.create(id, Initiator::Local).unwrap();

        assert_eq!(
            table.transition(id, StreamEvent::SendPushPromise).unwrap(),
            StreamState::ReservedLocal
        );
        assert_eq!(
            table.transition(id, StreamEvent::SendHeaders { end_stream: false }).unwrap(),
            StreamState::HalfClosedRemote
        );
        assert_eq!(
            table.transition(id, StreamEvent::SendData { end_stream: true }).unwrap(),
            StreamState::Closed
        );
    }

    #[test]
    fn test_client_side_of_push() {
        let mut table = StreamTable::new(Role::Client);
        table.create(2, Initiator::Remote).unwrap();
        table.transition(2, StreamEvent::RecvPushPromise).unwrap();
        assert_eq!(
            table.transition(2, StreamEvent::RecvHeaders { end_stream: false }).unwrap(),
            StreamState::HalfClosedLocal
        );
        assert_eq!(
            table.transition(2, StreamEvent::RecvData { end_stream: true }).unwrap(),
            StreamState::Closed
        );
    }

    #[test]
    fn test_local_ids_increase() {
        let mut client = StreamTable::new(Role::Client);
        assert_eq!(client.allocate_local_id().unwrap(), 1);
        assert_eq!(client.allocate_local_id().unwrap(), 3);

        let mut server = StreamTable::new(Role::Server);
        assert_eq!(server.allocate_local_id().unwrap(), 2);
        assert_eq!(server.allocate_local_id().unwrap(), 4);
    }

    #[test]
    fn test_parity_and_monotonic_ids() {
        let mut table = StreamTable::new(Role::Server);
        assert!(matches!(table.create(2, Initiator::Remote), Err(Error::Protocol(_))));

        table.create(5, Initiator::Remote).unwrap();
        assert!(matches!(table.create(3, Initiator::Remote), Err(Error::Protocol(_))));
        assert!(matches!(table.create(5, Initiator::Remote), Err(Error::Protocol(_))));
        assert!(table.create(7, Initiator::Remote).is_ok());
    }

    #[test]
    fn test_concurrency_limit() {
        let mut table = StreamTable::new(Role::Server);
        table.set_remote_limit(Some(1));

        table.create(1, Initiator::Remote).unwrap();
        table.transition(1, StreamEvent::RecvHeaders { end_stream: false }).unwrap();

        assert!(matches!(
            table.create(3, Initiator::Remote),
            Err(Error::StreamLimitExceeded(3))
        ));
        // Refused id is consumed
        assert!(matches!(table.create(3, Initiator::Remote), Err(Error::Protocol(_))));

        table.transition(1, StreamEvent::RecvReset).unwrap();
        assert!(table.create(5, Initiator::Remote).is_ok());
    }

    #[test]
    fn test_zero_limit_refuses_everything() {
        let mut table = StreamTable::new(Role::Server);
        table.set_remote_limit(Some(0));
        assert!(matches!(
            table.create(1, Initiator::Remote),
            Err(Error::StreamLimitExceeded(1))
        ));
    }

    #[test]
    fn test_reset_is_remembered() {
        let mut table = StreamTable::new(Role::Server);
        table.create(1, Initiator::Remote).unwrap();
        table.transition(1, StreamEvent::RecvHeaders { end_stream: false }).unwrap();
        table.transition(1, StreamEvent::RecvReset).unwrap();

        assert!(table.was_reset(1));
        expect_stream_error(
            table.transition(1, StreamEvent::RecvData { end_stream: false }),
            ErrorCode::StreamClosed,
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut table = StreamTable::new(Role::Server);
        table.create(1, Initiator::Remote).unwrap();
        table.transition(1, StreamEvent::RecvHeaders { end_stream: true }).unwrap();

        // Peer already half-closed its side
        expect_stream_error(
            table.transition(1, StreamEvent::RecvData { end_stream: false }),
            ErrorCode::StreamClosed,
        );

        table.create(3, Initiator::Remote).unwrap();
        expect_stream_error(
            table.transition(3, StreamEvent::SendData { end_stream: false }),
            ErrorCode::ProtocolError,
        );
        expect_stream_error(
            table.transition(9, StreamEvent::RecvData { end_stream: false }),
            ErrorCode::ProtocolError,
        );
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut table = StreamTable::new(Role::Server);
        table.create(1, Initiator::Remote).unwrap();
        assert!(table.reset(1));
        assert!(!table.contains(1));
        assert!(table.was_reset(1));
        assert!(!table.reset(3));
        assert!(table.was_reset(3));
    }

    #[test]
    fn test_stream_buffers() {
        let mut stream = Stream::new(1, Initiator::Remote);
        stream.set_received_headers(HeaderBlock::new().with(":path", "/"));
        stream.append_body(b"body data");
        stream.append_body(b" more");
        assert_eq!(stream.body(), b"body data more");

        assert_eq!(stream.take_received_headers().path(), Some("/"));
        assert_eq!(&stream.take_body()[..], b"body data more");
        assert!(stream.take_received_headers().is_empty());
        assert!(stream.body().is_empty());
    }

    #[test]
    fn test_recently_reset_is_bounded() {
        let mut table = StreamTable::new(Role::Server);
        for id in 0..(RECENTLY_RESET_CAPACITY as u32 + 10) {
            table.remember_reset(id * 2 + 1);
        }
        assert!(!table.was_reset(1));
        assert!(table.was_reset((RECENTLY_RESET_CAPACITY as u32 + 9) * 2 + 1));
    }

    #[test]
    fn test_drain() {
        let mut table = StreamTable::new(Role::Server);
        table.create(3, Initiator::Remote).unwrap();
        table.create(5, Initiator::Remote).unwrap();
        assert_eq!(table.drain(), vec![3, 5]);
        assert!(table.is_empty());
    }
}
