//! Blocking HTTP/2 client used by the socket tests

#![allow(dead_code)]

use bytes::Bytes;
use h2push::http::h2::{
    Connection, ConnectionEvent, H2Server, H2ServerBuilder, HeaderBlock, Settings, StreamId,
};
use h2push::http::session::{bind_listener, Transport};
use h2push::site::DemoSite;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn get(path: &str) -> HeaderBlock {
    HeaderBlock::new()
        .with(":method", "GET")
        .with(":scheme", "http")
        .with(":path", path)
        .with(":authority", "localhost")
}

/// Start `server` on an ephemeral port
pub fn spawn(server: H2Server<DemoSite>) -> SocketAddr {
    let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || server.serve(listener));
    addr
}

pub fn demo_server() -> H2Server<DemoSite> {
    H2ServerBuilder::new(DemoSite::new()).build()
}

/// Run `paths` as requests and collect client events until `responses`
/// complete responses arrived
pub fn fetch<T: Transport>(
    mut transport: T,
    settings: Settings,
    paths: &[&str],
    responses: usize,
) -> Vec<ConnectionEvent> {
    transport.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (mut reader, mut writer) = transport.split().unwrap();

    let mut client = Connection::client(settings);
    for path in paths {
        client.open_stream(get(path), Bytes::new()).unwrap();
    }

    let mut events = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    while count_responses(&events) < responses {
        let out = client.take_output();
        if !out.is_empty() {
            writer.write_all(&out).unwrap();
            writer.flush().unwrap();
        }
        let n = reader.read(&mut buf).unwrap();
        assert!(n > 0, "server hung up early");
        client.recv(&buf[..n]).unwrap();
        events.extend(std::iter::from_fn(|| client.poll_event()));
    }
    events
}

fn count_responses(events: &[ConnectionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::Response { .. }))
        .count()
}

pub fn response(events: &[ConnectionEvent], id: StreamId) -> Option<(HeaderBlock, Bytes)> {
    events.iter().find_map(|e| match e {
        ConnectionEvent::Response {
            stream_id,
            headers,
            body,
        } if *stream_id == id => Some((headers.clone(), body.clone())),
        _ => None,
    })
}
