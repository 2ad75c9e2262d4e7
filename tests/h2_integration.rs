//! Engine-to-engine HTTP/2 tests
//!
//! A client [`Connection`] and a server [`Connection`] exchange bytes in
//! memory. The server side answers through [`DemoSite`] unless a test
//! drives it by hand.

use bytes::Bytes;
use h2push::http::h2::codec::FrameCodec;
use h2push::http::h2::hpack::decode_integer;
use h2push::http::h2::{
    Connection, ConnectionEvent, Error, ErrorCode, Frame, Handler, HeaderBlock, Request,
    Responder, Settings, SettingsBuilder, StreamId, StreamState,
};
use h2push::site::{DemoSite, CSS, HTML};

fn get(path: &str) -> HeaderBlock {
    HeaderBlock::new()
        .with(":method", "GET")
        .with(":scheme", "http")
        .with(":path", path)
        .with(":authority", "localhost:6565")
}

/// Decode everything in `bytes` (no preface)
fn frames(bytes: &[u8]) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    codec.feed(bytes);
    let mut out = Vec::new();
    while let Some(frame) = codec.next_frame().unwrap() {
        out.push(frame);
    }
    out
}

/// Frames that carry stream content, connection chatter removed
fn stream_frames(bytes: &[u8]) -> Vec<Frame> {
    frames(bytes)
        .into_iter()
        .filter(|f| {
            matches!(
                f,
                Frame::Headers(_) | Frame::Data(_) | Frame::PushPromise(_) | Frame::RstStream(_)
            )
        })
        .collect()
}

/// Hand pending server requests to the site
fn serve(server: &mut Connection, site: &DemoSite) -> Vec<ConnectionEvent> {
    let mut other = Vec::new();
    while let Some(event) = server.poll_event() {
        match event {
            ConnectionEvent::Request {
                stream_id,
                headers,
                body,
            } => {
                let mut responder = Responder::new(server, stream_id);
                site.on_request(Request::new(stream_id, headers, body), &mut responder);
            }
            event => other.push(event),
        }
    }
    other
}

fn drain(conn: &mut Connection) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}

/// Move bytes both ways until both ends go quiet
fn pump(client: &mut Connection, server: &mut Connection, site: &DemoSite) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    for _ in 0..32 {
        let to_server = client.take_output();
        server.recv(&to_server).unwrap();
        serve(server, site);
        let to_client = server.take_output();
        client.recv(&to_client).unwrap();
        events.extend(drain(client));
        if to_server.is_empty() && to_client.is_empty() && !client.wants_write() {
            break;
        }
    }
    events
}

fn connected(client_settings: Settings, server_settings: Settings) -> (Connection, Connection) {
    let mut client = Connection::client(client_settings);
    let mut server = Connection::server(server_settings);
    pump(&mut client, &mut server, &DemoSite::new());
    (client, server)
}

fn response(events: &[ConnectionEvent], id: StreamId) -> Option<(HeaderBlock, Bytes)> {
    events.iter().find_map(|e| match e {
        ConnectionEvent::Response {
            stream_id,
            headers,
            body,
        } if *stream_id == id => Some((headers.clone(), body.clone())),
        _ => None,
    })
}

#[test]
fn test_push_promise_precedes_everything_on_the_wire() {
    let site = DemoSite::new();
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    let stream_id = client.open_stream(get("/all"), Bytes::new()).unwrap();
    assert_eq!(stream_id, 1);
    server.recv(&client.take_output()).unwrap();
    serve(&mut server, &site);
    let wire = server.take_output();

    let sequence: Vec<(&str, StreamId)> = stream_frames(&wire)
        .iter()
        .map(|f| (f.name(), f.stream_id()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            ("PUSH_PROMISE", 1),
            ("HEADERS", 2),
            ("DATA", 2),
            ("HEADERS", 1),
            ("DATA", 1),
        ]
    );
    match &stream_frames(&wire)[0] {
        Frame::PushPromise(pp) => assert_eq!(pp.promised_stream_id, 2),
        other => panic!("unexpected {:?}", other),
    }

    client.recv(&wire).unwrap();
    let events = drain(&mut client);
    match &events[0] {
        ConnectionEvent::PushPromise {
            stream_id,
            promised_stream_id,
            headers,
        } => {
            assert_eq!((*stream_id, *promised_stream_id), (1, 2));
            assert_eq!(headers.method(), Some("GET"));
            assert_eq!(headers.path(), Some("/main.css"));
        }
        other => panic!("expected the promise first, got {:?}", other),
    }
    assert_eq!(&response(&events, 2).unwrap().1[..], CSS.as_bytes());
    assert_eq!(&response(&events, 1).unwrap().1[..], HTML.as_bytes());
    assert_eq!(client.stream_state(1), StreamState::Closed);
    assert_eq!(client.stream_state(2), StreamState::Closed);
}

/// First byte of every field representation in an HPACK block
fn representations(mut block: &[u8]) -> Vec<u8> {
    fn skip_string(block: &mut &[u8]) {
        let len = decode_integer(block, 7).unwrap();
        *block = &block[len..];
    }
    fn skip_literal(block: &mut &[u8], prefix_bits: u8) {
        if decode_integer(block, prefix_bits).unwrap() == 0 {
            skip_string(block);
        }
        skip_string(block);
    }

    let mut kinds = Vec::new();
    while let Some(&first) = block.first() {
        kinds.push(first);
        if first & 0x80 != 0 {
            decode_integer(&mut block, 7).unwrap();
        } else if first & 0x40 != 0 {
            skip_literal(&mut block, 6);
        } else if first & 0x20 != 0 {
            decode_integer(&mut block, 5).unwrap();
        } else {
            skip_literal(&mut block, 4);
        }
    }
    kinds
}

#[test]
fn test_zero_header_table_turns_off_indexing() {
    let site = DemoSite::new();
    let client_settings = SettingsBuilder::new().header_table_size(0).build().unwrap();
    let (mut client, mut server) = connected(client_settings, Settings::new());

    let mut blocks = Vec::new();
    for path in ["/", "/main.css"] {
        let stream_id = client.open_stream(get(path), Bytes::new()).unwrap();
        server.recv(&client.take_output()).unwrap();
        serve(&mut server, &site);
        let wire = server.take_output();
        blocks.extend(frames(&wire).into_iter().filter_map(|f| match f {
            Frame::Headers(h) => Some(h.header_block),
            _ => None,
        }));

        client.recv(&wire).unwrap();
        let events = drain(&mut client);
        let (headers, _) = response(&events, stream_id).unwrap();
        assert_eq!(headers.status(), Some(200));
    }

    assert_eq!(blocks.len(), 2);
    // Size update to 0 leads the first block only
    assert_eq!(blocks[0][0], 0x20);
    assert_ne!(blocks[1][0] & 0xe0, 0x20);
    for block in &blocks {
        let kinds = representations(block);
        assert!(!kinds.iter().any(|b| b & 0xc0 == 0x40), "indexed literal in {:x?}", block);
    }
}

#[test]
fn test_several_requests_on_one_connection() {
    let site = DemoSite::new();
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    let css = client.open_stream(get("/main.css"), Bytes::new()).unwrap();
    let page = client.open_stream(get("/index.html"), Bytes::new()).unwrap();
    let all = client.open_stream(get("/all"), Bytes::new()).unwrap();
    assert_eq!((css, page, all), (1, 3, 5));

    let events = pump(&mut client, &mut server, &site);
    assert_eq!(&response(&events, 1).unwrap().1[..], CSS.as_bytes());
    assert_eq!(&response(&events, 3).unwrap().1[..], HTML.as_bytes());
    assert_eq!(&response(&events, 5).unwrap().1[..], HTML.as_bytes());
    // The push for stream 5 takes the first server id
    assert_eq!(&response(&events, 2).unwrap().1[..], CSS.as_bytes());
    assert_eq!(site.pushes(), 1);
}

#[test]
fn test_refused_stream_leaves_connection_usable() {
    let site = DemoSite::new();
    let server_settings = SettingsBuilder::new()
        .max_concurrent_streams(0)
        .build()
        .unwrap();
    let mut client = Connection::client(Settings::new());
    let mut server = Connection::server(server_settings);

    // Sent before the client learns the limit
    client.open_stream(get("/index.html"), Bytes::new()).unwrap();
    server.recv(&client.take_output()).unwrap();
    assert!(serve(&mut server, &site).is_empty());
    assert!(!server.is_closed());

    let wire = server.take_output();
    assert!(frames(&wire).iter().any(|f| matches!(
        f,
        Frame::RstStream(rst) if rst.stream_id == 1 && rst.error_code == ErrorCode::RefusedStream
    )));
    client.recv(&wire).unwrap();
    assert!(drain(&mut client).contains(&ConnectionEvent::StreamAborted {
        stream_id: 1,
        code: ErrorCode::RefusedStream,
    }));

    // While the limit holds the client does not even try
    assert!(matches!(
        client.open_stream(get("/"), Bytes::new()),
        Err(Error::StreamLimitExceeded(3))
    ));

    server
        .update_local_settings(SettingsBuilder::new().max_concurrent_streams(4).build().unwrap())
        .unwrap();
    pump(&mut client, &mut server, &site);

    let stream_id = client.open_stream(get("/main.css"), Bytes::new()).unwrap();
    let events = pump(&mut client, &mut server, &site);
    assert_eq!(&response(&events, stream_id).unwrap().1[..], CSS.as_bytes());
}

#[test]
fn test_flow_control_blocks_and_resumes() {
    let client_settings = SettingsBuilder::new()
        .initial_window_size(16)
        .build()
        .unwrap();
    let (mut client, mut server) = connected(client_settings, Settings::new());

    let stream_id = client.open_stream(get("/big"), Bytes::new()).unwrap();
    server.recv(&client.take_output()).unwrap();
    match server.poll_event() {
        Some(ConnectionEvent::Request { stream_id: 1, .. }) => {}
        other => panic!("expected request, got {:?}", other),
    }
    let body = Bytes::from(vec![b'x'; 100]);
    server
        .send_response(
            stream_id,
            HeaderBlock::new().with(":status", "200"),
            body.clone(),
            true,
        )
        .unwrap();

    let wire = server.take_output();
    let sent: usize = frames(&wire)
        .iter()
        .filter_map(|f| match f {
            Frame::Data(d) => Some(d.data.len()),
            _ => None,
        })
        .sum();
    assert_eq!(sent, 16);
    assert!(server.wants_write());

    // Nothing more until the client opens the window
    assert!(stream_frames(&server.take_output()).is_empty());

    client.recv(&wire).unwrap();
    let events = pump(&mut client, &mut server, &DemoSite::new());
    let (headers, received) = response(&events, stream_id).unwrap();
    assert_eq!(headers.status(), Some(200));
    assert_eq!(received, body);
    assert!(!server.wants_write());
}

#[test]
fn test_goaway_refuses_unprocessed_streams() {
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    server.go_away(ErrorCode::NoError, "maintenance");
    assert!(server.is_finished());

    // Crosses the GOAWAY in flight
    let late = client.open_stream(get("/"), Bytes::new()).unwrap();
    let crossing = client.take_output();
    client.recv(&server.take_output()).unwrap();
    let events = drain(&mut client);
    assert_eq!(
        events,
        vec![
            ConnectionEvent::StreamAborted {
                stream_id: late,
                code: ErrorCode::RefusedStream,
            },
            ConnectionEvent::GoAway {
                last_stream_id: 0,
                code: ErrorCode::NoError,
                debug_data: Bytes::from_static(b"maintenance"),
            },
        ]
    );
    assert_eq!(client.goaway_received(), Some(0));
    assert!(matches!(
        client.open_stream(get("/"), Bytes::new()),
        Err(Error::ConnectionClosed)
    ));

    // The server ignores the stream it never agreed to handle
    server.recv(&crossing).unwrap();
    assert!(server.poll_event().is_none());
    assert!(server.is_finished());
}

#[test]
fn test_goaway_lets_open_streams_finish() {
    let site = DemoSite::new();
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    client.open_stream(get("/main.css"), Bytes::new()).unwrap();
    server.recv(&client.take_output()).unwrap();
    let request = server.poll_event();
    assert!(matches!(request, Some(ConnectionEvent::Request { stream_id: 1, .. })));

    server.go_away(ErrorCode::NoError, "");
    assert!(!server.is_finished());
    server
        .send_response(
            1,
            HeaderBlock::new().with(":status", "200"),
            Bytes::from_static(b"late but complete"),
            true,
        )
        .unwrap();

    let events = pump(&mut client, &mut server, &site);
    assert_eq!(&response(&events, 1).unwrap().1[..], b"late but complete");
    assert!(server.is_finished());
}

#[test]
fn test_large_header_block_uses_continuation() {
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    let big = "a".repeat(40_000);
    let headers = get("/").with("x-large", big.clone());
    client.open_stream(headers, Bytes::new()).unwrap();

    let wire = client.take_output();
    let continuations = frames(&wire)
        .iter()
        .filter(|f| matches!(f, Frame::Continuation(_)))
        .count();
    assert!(continuations >= 1);

    server.recv(&wire).unwrap();
    match server.poll_event() {
        Some(ConnectionEvent::Request { headers, .. }) => {
            assert_eq!(headers.get("x-large"), Some(big.as_str()));
        }
        other => panic!("expected request, got {:?}", other),
    }
}

#[test]
fn test_client_cancels_push() {
    let site = DemoSite::new();
    // Small enough that the pushed stylesheet stalls on flow control
    let client_settings = SettingsBuilder::new()
        .initial_window_size(32)
        .build()
        .unwrap();
    let (mut client, mut server) = connected(client_settings, Settings::new());

    client.open_stream(get("/all"), Bytes::new()).unwrap();
    server.recv(&client.take_output()).unwrap();
    serve(&mut server, &site);
    client.recv(&server.take_output()).unwrap();
    assert!(drain(&mut client)
        .iter()
        .any(|e| matches!(e, ConnectionEvent::PushPromise { promised_stream_id: 2, .. })));

    client.reset_stream(2, ErrorCode::Cancel);
    assert_eq!(client.stream_state(2), StreamState::Closed);
    server.recv(&client.take_output()).unwrap();
    assert!(serve(&mut server, &site).contains(&ConnectionEvent::StreamAborted {
        stream_id: 2,
        code: ErrorCode::Cancel,
    }));

    let events = pump(&mut client, &mut server, &site);
    assert!(response(&events, 2).is_none());
    assert_eq!(&response(&events, 1).unwrap().1[..], HTML.as_bytes());
    assert!(!server.is_closed());
}

#[test]
fn test_request_body_is_delivered() {
    let (mut client, mut server) = connected(Settings::new(), Settings::new());

    let headers = HeaderBlock::new()
        .with(":method", "POST")
        .with(":scheme", "http")
        .with(":path", "/upload")
        .with(":authority", "localhost");
    client
        .open_stream(headers, Bytes::from_static(b"payload"))
        .unwrap();
    server.recv(&client.take_output()).unwrap();

    match server.poll_event() {
        Some(ConnectionEvent::Request { headers, body, .. }) => {
            assert_eq!(headers.method(), Some("POST"));
            assert_eq!(&body[..], b"payload");
        }
        other => panic!("expected request, got {:?}", other),
    }
}

#[test]
fn test_garbage_instead_of_preface() {
    let mut server = Connection::server(Settings::new());
    let err = server.recv(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
    assert!(matches!(err, Error::MissingPreface));
    assert!(server.is_closed());

    let goaway = frames(&server.take_output())
        .into_iter()
        .find_map(|f| match f {
            Frame::Goaway(g) => Some(g),
            _ => None,
        })
        .unwrap();
    assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
}
