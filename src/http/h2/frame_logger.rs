//! Per-frame logging
//!
//! Every frame the connection reads or writes can be reported under the
//! `h2push::frame` target, e.g. `RUST_LOG=h2push::frame=info`.

use super::frames::Frame;
use std::fmt;
use tracing::Level;

/// Target used for frame events
pub const FRAME_TARGET: &str = "h2push::frame";

/// Which way a frame travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        })
    }
}

/// Logs frames at a fixed level
#[derive(Debug, Clone, Copy)]
pub struct FrameLogger {
    level: Level,
}

impl FrameLogger {
    pub fn new(level: Level) -> Self {
        FrameLogger { level }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Emit one event describing `frame`
    pub fn log(&self, direction: Direction, frame: &Frame) {
        let summary = FrameSummary(frame);
        let stream_id = frame.stream_id();
        let kind = frame.name();

        if self.level == Level::ERROR {
            tracing::error!(target: FRAME_TARGET, %direction, kind, stream_id, "{}", summary);
        } else if self.level == Level::WARN {
            tracing::warn!(target: FRAME_TARGET, %direction, kind, stream_id, "{}", summary);
        } else if self.level == Level::INFO {
            tracing::info!(target: FRAME_TARGET, %direction, kind, stream_id, "{}", summary);
        } else if self.level == Level::DEBUG {
            tracing::debug!(target: FRAME_TARGET, %direction, kind, stream_id, "{}", summary);
        } else {
            tracing::trace!(target: FRAME_TARGET, %direction, kind, stream_id, "{}", summary);
        }
    }
}

impl Default for FrameLogger {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

/// One-line description of a frame's contents
pub struct FrameSummary<'a>(pub &'a Frame);

impl fmt::Display for FrameSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Frame::Data(d) => write!(
                f,
                "length={} padding={} end_stream={}",
                d.data.len(),
                d.padding.unwrap_or(0),
                d.end_stream
            ),
            Frame::Headers(h) => write!(
                f,
                "block={} end_stream={} end_headers={} priority={:?}",
                h.header_block.len(),
                h.end_stream,
                h.end_headers,
                h.priority
            ),
            Frame::Priority(p) => write!(
                f,
                "dependency={} weight={} exclusive={}",
                p.priority.stream_dependency,
                p.priority.effective_weight(),
                p.priority.exclusive
            ),
            Frame::RstStream(r) => write!(f, "error_code={}", r.error_code),
            Frame::Settings(s) if s.ack => f.write_str("ack=true"),
            Frame::Settings(s) => {
                f.write_str("ack=false")?;
                for (param, value) in s.settings.parameters() {
                    write!(f, " {}={}", param.name(), value)?;
                }
                Ok(())
            }
            Frame::PushPromise(p) => write!(
                f,
                "promised_stream_id={} block={} end_headers={}",
                p.promised_stream_id,
                p.header_block.len(),
                p.end_headers
            ),
            Frame::Ping(p) => write!(f, "ack={} data={:02x?}", p.ack, p.data),
            Frame::Goaway(g) => write!(
                f,
                "last_stream_id={} error_code={} debug={:?}",
                g.last_stream_id,
                g.error_code,
                String::from_utf8_lossy(&g.debug_data)
            ),
            Frame::WindowUpdate(w) => write!(f, "increment={}", w.size_increment),
            Frame::Continuation(c) => write!(
                f,
                "block={} end_headers={}",
                c.header_block.len(),
                c.end_headers
            ),
            Frame::Unknown(u) => write!(
                f,
                "type=0x{:02x} flags=0x{:02x} length={}",
                u.frame_type,
                u.flags.as_u8(),
                u.payload.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::error::ErrorCode;
    use crate::http::h2::frames::{DataFrame, GoawayFrame, SettingsFrame};
    use crate::http::h2::settings::SettingsBuilder;
    use bytes::Bytes;

    #[test]
    fn test_summaries() {
        let data = Frame::Data(DataFrame::new(1, Bytes::from_static(b"hello"), true));
        assert_eq!(
            FrameSummary(&data).to_string(),
            "length=5 padding=0 end_stream=true"
        );

        let settings = SettingsBuilder::new().max_concurrent_streams(10).build().unwrap();
        let frame = Frame::Settings(SettingsFrame::new(settings));
        assert_eq!(
            FrameSummary(&frame).to_string(),
            "ack=false MAX_CONCURRENT_STREAMS=10"
        );

        let goaway = Frame::Goaway(GoawayFrame::new(
            3,
            ErrorCode::ProtocolError,
            Bytes::from_static(b"bad"),
        ));
        assert_eq!(
            FrameSummary(&goaway).to_string(),
            "last_stream_id=3 error_code=PROTOCOL_ERROR (0x1) debug=\"bad\""
        );
    }

    #[test]
    fn test_log_without_subscriber() {
        let logger = FrameLogger::default();
        assert_eq!(logger.level(), Level::INFO);
        logger.log(Direction::Outbound, &Frame::Settings(SettingsFrame::ack()));
        assert_eq!(Direction::Inbound.to_string(), "INBOUND");
    }
}
