//! Errors and RFC 7540 Section 7 error codes
//!
//! Every [`Error`] has an [`ErrorScope`]. Connection errors end in GOAWAY,
//! stream errors in RST_STREAM; transport errors abort every stream without
//! writing anything.

use super::stream::StreamId;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed frame; `code` is PROTOCOL_ERROR, FRAME_SIZE_ERROR or
    /// FLOW_CONTROL_ERROR depending on what was wrong
    #[error("bad frame ({code}): {reason}")]
    FrameFormat { code: ErrorCode, reason: String },

    /// HPACK decoding failed; the tables can no longer be trusted
    #[error("header compression: {0}")]
    Compression(String),

    /// A decoded field is unusable, e.g. not UTF-8; the HPACK context is
    /// intact, so only the stream carrying it needs to fail
    #[error("malformed header field: {0}")]
    MalformedField(String),

    /// Header block fragments kept coming past what we buffer
    #[error("header block of {0} bytes exceeds the limit")]
    HeaderBlockTooLarge(usize),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("stream {stream_id} failed ({code}): {reason}")]
    Stream {
        stream_id: StreamId,
        code: ErrorCode,
        reason: String,
    },

    /// The peer overran the connection window, or a window overflowed
    #[error("flow control: {0}")]
    FlowControl(String),

    #[error("stream {0} refused: concurrency limit reached")]
    StreamLimitExceeded(StreamId),

    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("client preface missing or malformed")]
    MissingPreface,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("tls: {0}")]
    Tls(String),
}

/// How far an error reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Connection,
    Stream(StreamId),
    Transport,
}

impl Error {
    pub fn stream(stream_id: StreamId, code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Stream {
            stream_id,
            code,
            reason: reason.into(),
        }
    }

    pub fn frame_format(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::FrameFormat {
            code,
            reason: reason.into(),
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            Error::Stream { stream_id, .. } => ErrorScope::Stream(*stream_id),
            Error::StreamLimitExceeded(id) | Error::StreamClosed(id) => ErrorScope::Stream(*id),
            Error::Transport(_) | Error::ConnectionClosed | Error::Tls(_) => ErrorScope::Transport,
            Error::FrameFormat { .. }
            | Error::Compression(_)
            | Error::MalformedField(_)
            | Error::HeaderBlockTooLarge(_)
            | Error::Protocol(_)
            | Error::FlowControl(_)
            | Error::InvalidSettings(_)
            | Error::MissingPreface => ErrorScope::Connection,
        }
    }

    /// Code for the RST_STREAM or GOAWAY this error turns into
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::FrameFormat { code, .. } | Error::Stream { code, .. } => *code,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Protocol(_)
            | Error::MalformedField(_)
            | Error::MissingPreface
            | Error::InvalidSettings(_) => ErrorCode::ProtocolError,
            Error::HeaderBlockTooLarge(_) => ErrorCode::EnhanceYourCalm,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::StreamLimitExceeded(_) => ErrorCode::RefusedStream,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::Transport(_) | Error::ConnectionClosed | Error::Tls(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Tls(e.to_string())
    }
}

macro_rules! error_codes {
    ($($variant:ident = $value:literal, $name:literal;)*) => {
        /// RST_STREAM and GOAWAY error codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ErrorCode {
            $($variant = $value,)*
        }

        impl ErrorCode {
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($value => Some(ErrorCode::$variant),)*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $name,)*
                }
            }
        }
    };
}

error_codes! {
    NoError = 0x0, "NO_ERROR";
    ProtocolError = 0x1, "PROTOCOL_ERROR";
    InternalError = 0x2, "INTERNAL_ERROR";
    FlowControlError = 0x3, "FLOW_CONTROL_ERROR";
    SettingsTimeout = 0x4, "SETTINGS_TIMEOUT";
    StreamClosed = 0x5, "STREAM_CLOSED";
    FrameSizeError = 0x6, "FRAME_SIZE_ERROR";
    RefusedStream = 0x7, "REFUSED_STREAM";
    Cancel = 0x8, "CANCEL";
    CompressionError = 0x9, "COMPRESSION_ERROR";
    ConnectError = 0xa, "CONNECT_ERROR";
    EnhanceYourCalm = 0xb, "ENHANCE_YOUR_CALM";
    InadequateSecurity = 0xc, "INADEQUATE_SECURITY";
    Http11Required = 0xd, "HTTP_1_1_REQUIRED";
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Unknown codes must not be treated as special; map them to
    /// INTERNAL_ERROR
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
