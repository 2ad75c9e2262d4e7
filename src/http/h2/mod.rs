//! HTTP/2 with server push
//!
//! Framing, HPACK, streams and flow control (RFC 7540, RFC 7541), plus a
//! threaded server that drives one engine per connection.
//!
//! # Architecture
//!
//! - [`codec`] and [`frames`]: the 9-byte frame header and every frame type
//! - [`hpack`]: header compression with static, dynamic and Huffman coding
//! - [`stream`]: the stream table and the RFC 7540 Section 5.1 state machine
//! - [`flow_control`]: connection and stream windows on both directions
//! - [`connection`]: the sans-IO engine tying the pieces together
//! - [`server`]: threads that drive one engine per accepted transport
//!
//! # Example
//!
//! ```no_run
//! use h2push::http::h2::{H2ServerBuilder, SettingsBuilder};
//! use h2push::site::DemoSite;
//! use std::net::TcpListener;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = SettingsBuilder::new().max_concurrent_streams(100).build()?;
//! let server = H2ServerBuilder::new(DemoSite::new()).settings(settings).build();
//!
//! let listener = TcpListener::bind("127.0.0.1:6565")?;
//! server.serve(listener)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame_logger;
pub mod frames;
pub mod hpack;
pub mod server;
pub mod settings;
pub mod stream;

pub use codec::FrameCodec;
pub use connection::{Connection, ConnectionEvent};
pub use error::{Error, ErrorCode, ErrorScope, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use hpack::{HeaderBlock, HeaderField};
pub use server::{H2Server, H2ServerBuilder, Handler, Request, Responder};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{Role, StreamId, StreamState};

/// First bytes a client sends, before its SETTINGS (RFC 7540 Section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

// Protocol defaults that apply until SETTINGS says otherwise
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;

/// Stream identifiers are 31 bits
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Frames on stream 0 concern the whole connection
pub const CONNECTION_STREAM_ID: u32 = 0;
