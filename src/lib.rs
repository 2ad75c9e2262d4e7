//! h2push - HTTP/2 with server push
//!
//! A hand-rolled HTTP/2 stack (framing, HPACK, stream state machine, flow
//! control and PUSH_PROMISE) behind a sans-IO connection engine, a threaded
//! server that drives it over TCP or TLS, and a small demo site that pushes
//! its stylesheet.

pub mod http;
pub mod site;
