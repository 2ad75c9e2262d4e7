//! Frame model
//!
//! One struct per RFC 7540 Section 6 frame type, wrapped in the [`Frame`]
//! sum type the codec produces and the connection matches on. A type byte
//! the engine does not implement decodes to [`UnknownFrame`] and is
//! ignored upstream (Section 4.1).

use super::error::ErrorCode;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;
use std::fmt;

macro_rules! frame_types {
    ($($variant:ident = $byte:literal, $name:literal;)*) => {
        /// Wire type byte
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum FrameType {
            $($variant = $byte,)*
        }

        impl FrameType {
            pub fn as_u8(self) -> u8 {
                self as u8
            }

            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(FrameType::$variant),)*
                    _ => None,
                }
            }

            /// Name as written in RFC 7540
            pub fn name(&self) -> &'static str {
                match self {
                    $(FrameType::$variant => $name,)*
                }
            }
        }
    };
}

frame_types! {
    Data = 0x0, "DATA";
    Headers = 0x1, "HEADERS";
    Priority = 0x2, "PRIORITY";
    RstStream = 0x3, "RST_STREAM";
    Settings = 0x4, "SETTINGS";
    PushPromise = 0x5, "PUSH_PROMISE";
    Ping = 0x6, "PING";
    Goaway = 0x7, "GOAWAY";
    WindowUpdate = 0x8, "WINDOW_UPDATE";
    Continuation = 0x9, "CONTINUATION";
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// Flags byte of a frame header
///
/// Bit meanings depend on the frame type; ACK and END_STREAM share 0x1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn set_if(&mut self, cond: bool, flag: u8) {
        if cond {
            self.0 |= flag;
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded HTTP/2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    Unknown(UnknownFrame),
}

impl Frame {
    /// Stream the frame is sent on; 0 for connection-level frames
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(f) => f.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::Goaway(_) => 0,
        }
    }

    /// `None` for [`Frame::Unknown`]
    pub fn frame_type(&self) -> Option<FrameType> {
        let t = match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Priority(_) => FrameType::Priority,
            Frame::RstStream(_) => FrameType::RstStream,
            Frame::Settings(_) => FrameType::Settings,
            Frame::PushPromise(_) => FrameType::PushPromise,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Goaway(_) => FrameType::Goaway,
            Frame::WindowUpdate(_) => FrameType::WindowUpdate,
            Frame::Continuation(_) => FrameType::Continuation,
            Frame::Unknown(_) => return None,
        };
        Some(t)
    }

    pub fn name(&self) -> &'static str {
        self.frame_type().map_or("UNKNOWN", |t| t.name())
    }
}

macro_rules! into_frame {
    ($($frame:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$frame> for Frame {
                fn from(f: $frame) -> Self {
                    Frame::$variant(f)
                }
            }
        )*
    };
}

into_frame! {
    DataFrame => Data,
    HeadersFrame => Headers,
    PriorityFrame => Priority,
    RstStreamFrame => RstStream,
    SettingsFrame => Settings,
    PushPromiseFrame => PushPromise,
    PingFrame => Ping,
    GoawayFrame => Goaway,
    WindowUpdateFrame => WindowUpdate,
    ContinuationFrame => Continuation,
}

/// DATA (Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
    /// Pad length when PADDED was set
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(self, padding: u8) -> Self {
        DataFrame {
            padding: Some(padding),
            ..self
        }
    }

    /// Bytes charged to flow control: payload, pad length octet and padding
    pub fn flow_controlled_len(&self) -> usize {
        self.data.len() + self.padding.map_or(0, |pad| 1 + pad as usize)
    }
}

/// HEADERS (Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    /// HPACK fragment; the rest follows in CONTINUATION unless `end_headers`
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
            padding: None,
        }
    }

    pub fn with_priority(self, priority: PrioritySpec) -> Self {
        HeadersFrame {
            priority: Some(priority),
            ..self
        }
    }

    pub fn with_padding(self, padding: u8) -> Self {
        HeadersFrame {
            padding: Some(padding),
            ..self
        }
    }
}

/// Dependency and weight (Section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    /// Wire value, one less than the weight
    pub weight: u8,
}

impl PrioritySpec {
    pub fn new(stream_dependency: StreamId, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }

    /// Weight in 1..=256
    pub fn effective_weight(&self) -> u16 {
        u16::from(self.weight) + 1
    }
}

impl Default for PrioritySpec {
    /// Non-exclusive on stream 0, weight 16
    fn default() -> Self {
        PrioritySpec::new(0, false, 15)
    }
}

/// PRIORITY (Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PrioritySpec,
}

/// RST_STREAM (Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }
}

/// SETTINGS (Section 6.5); an ACK carries no parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE (Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    /// The client stream the promise is associated with
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    /// HPACK fragment of the promised request
    pub header_block: Bytes,
    pub end_headers: bool,
    pub padding: Option<u8>,
}

impl PushPromiseFrame {
    pub fn new(
        stream_id: StreamId,
        promised_stream_id: StreamId,
        header_block: Bytes,
        end_headers: bool,
    ) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers,
            padding: None,
        }
    }
}

/// PING (Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Answer echoing `data`
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY (Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Highest peer stream that was or may still be processed
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE (Section 6.9); stream 0 targets the connection window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// CONTINUATION (Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// Frame with a type byte outside 0x0..=0x9, kept opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    pub payload: Bytes,
}
