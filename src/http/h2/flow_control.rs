//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level,
//! so every DATA byte we send is taken from two windows at once.

use super::error::{Error, ErrorCode, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::stream::StreamId;
use super::DEFAULT_INITIAL_WINDOW_SIZE;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Flow control window
///
/// Tracks the available window size for one direction.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (negative after the initial size shrinks)
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Check if window has available capacity
    pub fn has_capacity(&self) -> bool {
        self.current_size > 0
    }

    /// Check if window can send specified amount
    pub fn can_send(&self, amount: usize) -> bool {
        self.current_size >= amount as i64
    }

    /// Available credit, zero when the window is exhausted or negative
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take up to `amount` of credit and return how much was granted
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.current_size -= granted as i64;
        granted
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        let new_size = self.current_size + increment as i64;

        // RFC 7540 Section 6.9.1
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS
    ///
    /// The difference is applied to the current size, which may go negative
    /// (RFC 7540 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "new window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;

        Ok(())
    }

    /// Increment that brings the window back to its initial size, once it
    /// has fallen below half of it
    pub fn pending_update(&self) -> Option<u32> {
        let initial_size = self.initial_size as i64;
        if self.current_size < initial_size / 2 {
            Some((initial_size - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// What a WINDOW_UPDATE applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTarget {
    Connection,
    Stream(StreamId),
}

impl WindowTarget {
    /// Target named by a WINDOW_UPDATE frame's stream id
    pub fn from_stream_id(stream_id: StreamId) -> Self {
        if stream_id == 0 {
            WindowTarget::Connection
        } else {
            WindowTarget::Stream(stream_id)
        }
    }
}

#[derive(Debug)]
struct StreamWindows {
    send: FlowControlWindow,
    recv: FlowControlWindow,
}

/// All windows of one connection
///
/// Stream windows are keyed by stream id and created when the stream opens.
#[derive(Debug)]
pub struct FlowControlManager {
    conn_send: FlowControlWindow,
    conn_recv: FlowControlWindow,
    streams: HashMap<StreamId, StreamWindows>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE
    initial_send: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE
    initial_recv: u32,
}

impl FlowControlManager {
    /// Connection windows always start at 65535; the initial sizes apply
    /// to streams only.
    pub fn new(initial_send: u32, initial_recv: u32) -> Self {
        FlowControlManager {
            conn_send: FlowControlWindow::new(),
            conn_recv: FlowControlWindow::new(),
            streams: HashMap::new(),
            initial_send,
            initial_recv,
        }
    }

    /// Create the windows of a new stream
    pub fn open_stream(&mut self, stream_id: StreamId) {
        let (send, recv) = (self.initial_send, self.initial_recv);
        self.streams.entry(stream_id).or_insert_with(|| StreamWindows {
            send: FlowControlWindow::with_initial_size(send),
            recv: FlowControlWindow::with_initial_size(recv),
        });
    }

    /// Drop a stream's windows (reset or closed)
    pub fn release_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Current send window of a target; `None` for an unknown stream
    pub fn send_window(&self, target: WindowTarget) -> Option<i64> {
        match target {
            WindowTarget::Connection => Some(self.conn_send.size()),
            WindowTarget::Stream(id) => self.streams.get(&id).map(|w| w.send.size()),
        }
    }

    /// Current receive window of a target; `None` for an unknown stream
    pub fn recv_window(&self, target: WindowTarget) -> Option<i64> {
        match target {
            WindowTarget::Connection => Some(self.conn_recv.size()),
            WindowTarget::Stream(id) => self.streams.get(&id).map(|w| w.recv.size()),
        }
    }

    /// Grant up to `amount` bytes of DATA on `stream_id` without waiting
    ///
    /// The grant is bounded by both the connection and the stream window
    /// and is debited from both. Unknown streams get nothing.
    pub fn reserve_send_credit(&mut self, stream_id: StreamId, amount: usize) -> usize {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(windows) => &mut windows.send,
            None => return 0,
        };
        let granted = amount.min(self.conn_send.available()).min(stream.available());
        stream.consume(granted);
        self.conn_send.consume(granted);
        trace!(stream_id, amount, granted, "send credit");
        granted
    }

    /// Whether `amount` bytes fit in both windows right now
    fn can_send(&self, stream_id: StreamId, amount: usize) -> bool {
        self.conn_send.can_send(amount)
            && self
                .streams
                .get(&stream_id)
                .map_or(false, |w| w.send.can_send(amount))
    }

    /// Apply a received WINDOW_UPDATE
    ///
    /// Updates for streams without windows (already closed) are ignored.
    pub fn apply_window_update(&mut self, target: WindowTarget, increment: u32) -> Result<()> {
        match target {
            WindowTarget::Connection => {
                if increment == 0 {
                    return Err(Error::Protocol(
                        "WINDOW_UPDATE with zero increment on connection".into(),
                    ));
                }
                self.conn_send.increase(increment)?;
            }
            WindowTarget::Stream(id) => {
                if increment == 0 {
                    return Err(Error::stream(
                        id,
                        ErrorCode::ProtocolError,
                        "WINDOW_UPDATE with zero increment",
                    ));
                }
                if let Some(windows) = self.streams.get_mut(&id) {
                    windows.send.increase(increment).map_err(|e| {
                        Error::stream(id, ErrorCode::FlowControlError, e.to_string())
                    })?;
                }
            }
        }
        debug!(?target, increment, "window update applied");
        Ok(())
    }

    /// Adopt the peer's new SETTINGS_INITIAL_WINDOW_SIZE
    ///
    /// Every open stream's send window moves by the difference.
    pub fn set_initial_send_window(&mut self, size: u32) -> Result<()> {
        for windows in self.streams.values_mut() {
            windows.send.update_initial_size(size)?;
        }
        self.initial_send = size;
        Ok(())
    }

    /// Our SETTINGS_INITIAL_WINDOW_SIZE as currently enforced
    pub fn initial_recv_window(&self) -> u32 {
        self.initial_recv
    }

    /// Adopt our own new SETTINGS_INITIAL_WINDOW_SIZE
    pub fn set_initial_recv_window(&mut self, size: u32) -> Result<()> {
        for windows in self.streams.values_mut() {
            windows.recv.update_initial_size(size)?;
        }
        self.initial_recv = size;
        Ok(())
    }

    /// Account for `amount` bytes of received DATA (padding included)
    ///
    /// Overrunning the connection window is a connection error; overrunning
    /// a stream window is a stream error.
    pub fn consume_recv(&mut self, stream_id: StreamId, amount: usize) -> Result<()> {
        self.conn_recv.decrease(amount);
        if self.conn_recv.size() < 0 {
            return Err(Error::FlowControl(format!(
                "peer overran connection window by {}",
                -self.conn_recv.size()
            )));
        }

        if let Some(windows) = self.streams.get_mut(&stream_id) {
            windows.recv.decrease(amount);
            if windows.recv.size() < 0 {
                return Err(Error::stream(
                    stream_id,
                    ErrorCode::FlowControlError,
                    "peer overran stream window",
                ));
            }
        }
        Ok(())
    }

    /// WINDOW_UPDATE increments to send, as `(stream id, increment)` with
    /// stream id 0 for the connection
    pub fn take_window_updates(&mut self) -> Vec<(StreamId, u32)> {
        let mut updates = Vec::new();

        if let Some(increment) = self.conn_recv.pending_update() {
            // Cannot overflow: the window is brought back to its initial size
            let _ = self.conn_recv.increase(increment);
            updates.push((0, increment));
        }

        let mut stream_updates: Vec<(StreamId, u32)> = self
            .streams
            .iter_mut()
            .filter_map(|(&id, windows)| {
                let increment = windows.recv.pending_update()?;
                windows.recv.increase(increment).ok()?;
                Some((id, increment))
            })
            .collect();
        stream_updates.sort_unstable();
        updates.extend(stream_updates);

        updates
    }
}

struct Shared {
    manager: Mutex<FlowControlManager>,
    credit: Condvar,
}

/// Flow control shared between threads
///
/// Writers that prefer to wait for credit instead of polling call
/// [`SharedFlowControl::reserve_send_credit_blocking`]; every window change
/// wakes them.
#[derive(Clone)]
pub struct SharedFlowControl {
    inner: Arc<Shared>,
}

impl SharedFlowControl {
    pub fn new(manager: FlowControlManager) -> Self {
        SharedFlowControl {
            inner: Arc::new(Shared {
                manager: Mutex::new(manager),
                credit: Condvar::new(),
            }),
        }
    }

    /// Lock the manager for direct access
    pub fn lock(&self) -> MutexGuard<'_, FlowControlManager> {
        self.inner.manager.lock()
    }

    /// Non-blocking grant, as [`FlowControlManager::reserve_send_credit`]
    pub fn reserve_send_credit(&self, stream_id: StreamId, amount: usize) -> usize {
        self.lock().reserve_send_credit(stream_id, amount)
    }

    /// Wait until both windows hold `amount` bytes, then take them
    ///
    /// Returns `amount`, or 0 when `timeout` elapses first or the stream's
    /// windows are released while waiting.
    pub fn reserve_send_credit_blocking(
        &self,
        stream_id: StreamId,
        amount: usize,
        timeout: Duration,
    ) -> usize {
        let deadline = Instant::now() + timeout;
        let mut manager = self.inner.manager.lock();

        loop {
            if !manager.has_stream(stream_id) {
                return 0;
            }
            if manager.can_send(stream_id, amount) {
                return manager.reserve_send_credit(stream_id, amount);
            }
            if self
                .inner
                .credit
                .wait_until(&mut manager, deadline)
                .timed_out()
            {
                debug!(stream_id, amount, "timed out waiting for send credit");
                return 0;
            }
        }
    }

    /// Apply a WINDOW_UPDATE and wake waiting writers
    pub fn apply_window_update(&self, target: WindowTarget, increment: u32) -> Result<()> {
        let result = self.lock().apply_window_update(target, increment);
        self.inner.credit.notify_all();
        result
    }

    /// Adopt the peer's initial window size and wake waiting writers
    pub fn set_initial_send_window(&self, size: u32) -> Result<()> {
        let result = self.lock().set_initial_send_window(size);
        self.inner.credit.notify_all();
        result
    }

    /// Release a stream and wake writers waiting on it
    pub fn release_stream(&self, stream_id: StreamId) {
        self.lock().release_stream(stream_id);
        self.inner.credit.notify_all();
    }
}
