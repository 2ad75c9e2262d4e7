//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec::decode`] turns wire bytes into [`Frame`] values and checks
//! the per-type rules of RFC 7540 Section 6; [`FrameCodec::encode`] does the
//! reverse and never fails for well-formed frames. Bytes arriving in pieces
//! can be buffered with [`FrameCodec::feed`] and drained with
//! [`FrameCodec::next_frame`].

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::{Settings, SettingsParameter};
use super::stream::StreamId;
use super::{CONNECTION_STREAM_ID, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length
    pub length: usize,
    /// Raw type byte
    pub frame_type: u8,
    /// Flags
    pub flags: FrameFlags,
    /// Stream ID with the reserved bit cleared
    pub stream_id: StreamId,
}

/// Frame codec for encoding/decoding HTTP/2 frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Largest payload accepted on decode (our SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: usize,
    /// Buffer for reading
    read_buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new frame codec accepting the default max frame size
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec accepting payloads up to `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        FrameCodec {
            max_frame_size: (max_frame_size as usize).min(MAX_FRAME_SIZE),
            read_buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Current decode limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Change the decode limit (after our SETTINGS_MAX_FRAME_SIZE changes)
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = (size as usize).min(MAX_FRAME_SIZE);
    }

    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: u8,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type;
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header from bytes
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Decode one frame from the front of `bytes`
    ///
    /// Returns `Ok(None)` while `bytes` holds less than a full frame, and the
    /// frame with the number of bytes it occupied otherwise.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<(Frame, usize)>> {
        let header = match self.check_header(bytes)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let total = FRAME_HEADER_SIZE + header.length;
        if bytes.len() < total {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..total]);
        let frame = Self::parse_payload(header, payload)?;
        Ok(Some((frame, total)))
    }

    /// Buffer bytes read from the transport
    pub fn feed(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Decode the next complete frame from the buffered input
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.check_header(&self.read_buffer)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if self.read_buffer.len() < FRAME_HEADER_SIZE + header.length {
            return Ok(None);
        }
        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(header.length).freeze();
        Self::parse_payload(header, payload).map(Some)
    }

    /// Parse the header at the front of `bytes` and enforce the size limit
    fn check_header(&self, bytes: &[u8]) -> Result<Option<FrameHeader>> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
        let header = Self::decode_header(&raw);
        if header.length > self.max_frame_size {
            return Err(Error::frame_format(
                ErrorCode::FrameSizeError,
                format!(
                    "frame length {} exceeds max frame size {}",
                    header.length, self.max_frame_size
                ),
            ));
        }
        Ok(Some(header))
    }

    fn parse_payload(header: FrameHeader, payload: Bytes) -> Result<Frame> {
        let FrameHeader {
            frame_type,
            flags,
            stream_id,
            ..
        } = header;

        let frame_type = match FrameType::from_u8(frame_type) {
            Some(t) => t,
            None => {
                return Ok(Frame::Unknown(UnknownFrame {
                    frame_type,
                    flags,
                    stream_id,
                    payload,
                }))
            }
        };

        match frame_type {
            FrameType::Data => {
                require_stream(frame_type, stream_id)?;
                let (data, padding) = strip_padding(frame_type, flags, payload)?;
                Ok(Frame::Data(DataFrame {
                    stream_id,
                    data,
                    end_stream: flags.is_end_stream(),
                    padding,
                }))
            }
            FrameType::Headers => {
                require_stream(frame_type, stream_id)?;
                let (mut block, padding) = strip_padding(frame_type, flags, payload)?;
                let priority = if flags.is_priority() {
                    if block.len() < 5 {
                        return Err(Error::frame_format(
                            ErrorCode::FrameSizeError,
                            "HEADERS too short for priority fields",
                        ));
                    }
                    Some(parse_priority(&mut block))
                } else {
                    None
                };
                Ok(Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: block,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                }))
            }
            FrameType::Priority => {
                require_stream(frame_type, stream_id)?;
                require_len(frame_type, &payload, 5)?;
                let mut payload = payload;
                Ok(Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: parse_priority(&mut payload),
                }))
            }
            FrameType::RstStream => {
                require_stream(frame_type, stream_id)?;
                require_len(frame_type, &payload, 4)?;
                let mut payload = payload;
                Ok(Frame::RstStream(RstStreamFrame::new(
                    stream_id,
                    ErrorCode::from_wire(payload.get_u32()),
                )))
            }
            FrameType::Settings => {
                require_connection(frame_type, stream_id)?;
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(Error::frame_format(
                            ErrorCode::FrameSizeError,
                            "SETTINGS ACK with a payload",
                        ));
                    }
                    return Ok(Frame::Settings(SettingsFrame::ack()));
                }
                if payload.len() % 6 != 0 {
                    return Err(Error::frame_format(
                        ErrorCode::FrameSizeError,
                        format!("SETTINGS length {} is not a multiple of 6", payload.len()),
                    ));
                }
                let mut settings = Settings::new();
                let mut payload = payload;
                while payload.has_remaining() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    // Unknown identifiers are ignored
                    if let Some(param) = SettingsParameter::from_u16(id) {
                        param.check_value(value).map_err(|code| {
                            Error::frame_format(
                                code,
                                format!("{} = {} is out of range", param, value),
                            )
                        })?;
                        settings.set(param, value);
                    }
                }
                Ok(Frame::Settings(SettingsFrame::new(settings)))
            }
            FrameType::PushPromise => {
                require_stream(frame_type, stream_id)?;
                let (mut block, padding) = strip_padding(frame_type, flags, payload)?;
                if block.len() < 4 {
                    return Err(Error::frame_format(
                        ErrorCode::FrameSizeError,
                        "PUSH_PROMISE too short for promised stream id",
                    ));
                }
                let promised_stream_id = block.get_u32() & 0x7FFF_FFFF;
                Ok(Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: flags.is_end_headers(),
                    padding,
                }))
            }
            FrameType::Ping => {
                require_connection(frame_type, stream_id)?;
                require_len(frame_type, &payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                require_connection(frame_type, stream_id)?;
                if payload.len() < 8 {
                    return Err(Error::frame_format(
                        ErrorCode::FrameSizeError,
                        format!("GOAWAY length {} is below 8", payload.len()),
                    ));
                }
                let mut payload = payload;
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Ok(Frame::Goaway(GoawayFrame::new(
                    last_stream_id,
                    error_code,
                    payload,
                )))
            }
            FrameType::WindowUpdate => {
                require_len(frame_type, &payload, 4)?;
                let mut payload = payload;
                Ok(Frame::WindowUpdate(WindowUpdateFrame::new(
                    stream_id,
                    payload.get_u32() & 0x7FFF_FFFF,
                )))
            }
            FrameType::Continuation => {
                require_stream(frame_type, stream_id)?;
                Ok(Frame::Continuation(ContinuationFrame {
                    stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                }))
            }
        }
    }

    /// Encode any frame
    pub fn encode(frame: &Frame) -> Bytes {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f),
            Frame::Headers(f) => Self::encode_headers_frame(f),
            Frame::Priority(f) => Self::encode_priority_frame(f),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(f),
            Frame::Settings(f) => Self::encode_settings_frame(f),
            Frame::PushPromise(f) => Self::encode_push_promise_frame(f),
            Frame::Ping(f) => Self::encode_ping_frame(f),
            Frame::Goaway(f) => Self::encode_goaway_frame(f),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(f),
            Frame::Continuation(f) => Self::encode_continuation_frame(f),
            Frame::Unknown(f) => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + f.payload.len());
                buf.put_slice(&Self::encode_header(
                    f.frame_type,
                    f.flags,
                    f.stream_id,
                    f.payload.len(),
                ));
                buf.put_slice(&f.payload);
                buf.freeze()
            }
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.end_stream, FrameFlags::END_STREAM);
        encode_padded(
            FrameType::Data,
            flags,
            frame.stream_id,
            frame.padding,
            &[],
            &frame.data,
        )
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.end_stream, FrameFlags::END_STREAM);
        flags.set_if(frame.end_headers, FrameFlags::END_HEADERS);

        let mut prefix = BytesMut::new();
        if let Some(priority) = &frame.priority {
            flags.set(FrameFlags::PRIORITY);
            put_priority(&mut prefix, priority);
        }

        encode_padded(
            FrameType::Headers,
            flags,
            frame.stream_id,
            frame.padding,
            &prefix,
            &frame.header_block,
        )
    }

    /// Encode a PUSH_PROMISE frame
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.end_headers, FrameFlags::END_HEADERS);
        let promised = (frame.promised_stream_id & 0x7FFF_FFFF).to_be_bytes();
        encode_padded(
            FrameType::PushPromise,
            flags,
            frame.stream_id,
            frame.padding,
            &promised,
            &frame.header_block,
        )
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.end_headers, FrameFlags::END_HEADERS);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation.as_u8(),
            flags,
            frame.stream_id,
            frame.header_block.len(),
        ));
        buf.put_slice(&frame.header_block);
        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.ack, FrameFlags::ACK);

        // Each setting is 6 bytes (2 byte ID + 4 byte value)
        let mut settings_data = BytesMut::new();
        if !frame.ack {
            for (param, value) in frame.settings.parameters() {
                settings_data.put_u16(param.as_u16());
                settings_data.put_u32(value);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + settings_data.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Settings.as_u8(),
            flags,
            0,
            settings_data.len(),
        ));
        buf.put_slice(&settings_data);
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(frame.ack, FrameFlags::ACK);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping.as_u8(), flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        // 4 bytes last stream ID + 4 bytes error code + debug data
        let payload_len = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway.as_u8(),
            FrameFlags::empty(),
            0,
            payload_len,
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        // Reserved bit must be 0
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        buf.put_slice(&Self::encode_header(
            FrameType::Priority.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            5,
        ));
        put_priority(&mut buf, &frame.priority);
        buf.freeze()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn require_stream(frame_type: FrameType, stream_id: StreamId) -> Result<()> {
    if stream_id == CONNECTION_STREAM_ID {
        return Err(Error::frame_format(
            ErrorCode::ProtocolError,
            format!("{} on stream 0", frame_type.name()),
        ));
    }
    Ok(())
}

fn require_connection(frame_type: FrameType, stream_id: StreamId) -> Result<()> {
    if stream_id != CONNECTION_STREAM_ID {
        return Err(Error::frame_format(
            ErrorCode::ProtocolError,
            format!("{} on stream {}", frame_type.name(), stream_id),
        ));
    }
    Ok(())
}

fn require_len(frame_type: FrameType, payload: &Bytes, expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::frame_format(
            ErrorCode::FrameSizeError,
            format!(
                "{} length {} (expected {})",
                frame_type.name(),
                payload.len(),
                expected
            ),
        ));
    }
    Ok(())
}

/// Remove the pad length byte and trailing padding when PADDED is set
fn strip_padding(
    frame_type: FrameType,
    flags: FrameFlags,
    mut payload: Bytes,
) -> Result<(Bytes, Option<u8>)> {
    if !flags.is_padded() {
        return Ok((payload, None));
    }
    if payload.is_empty() {
        return Err(Error::frame_format(
            ErrorCode::FrameSizeError,
            format!("padded {} without pad length", frame_type.name()),
        ));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.len() {
        return Err(Error::frame_format(
            ErrorCode::ProtocolError,
            format!(
                "{} padding {} exceeds payload {}",
                frame_type.name(),
                pad_len,
                payload.len()
            ),
        ));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok((payload, Some(pad_len)))
}

fn parse_priority(buf: &mut Bytes) -> PrioritySpec {
    let dep = buf.get_u32();
    let weight = buf.get_u8();
    PrioritySpec::new(dep & 0x7FFF_FFFF, dep & 0x8000_0000 != 0, weight)
}

fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

/// Write header, optional pad length, fixed prefix, body and zero padding
fn encode_padded(
    frame_type: FrameType,
    mut flags: FrameFlags,
    stream_id: StreamId,
    padding: Option<u8>,
    prefix: &[u8],
    body: &[u8],
) -> Bytes {
    let mut payload_len = prefix.len() + body.len();
    if let Some(pad_len) = padding {
        flags.set(FrameFlags::PADDED);
        payload_len += 1 + pad_len as usize;
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
    buf.put_slice(&FrameCodec::encode_header(
        frame_type.as_u8(),
        flags,
        stream_id,
        payload_len,
    ));
    if let Some(pad_len) = padding {
        buf.put_u8(pad_len);
    }
    buf.put_slice(prefix);
    buf.put_slice(body);
    if let Some(pad_len) = padding {
        buf.put_bytes(0, pad_len as usize);
    }
    buf.freeze()
}
