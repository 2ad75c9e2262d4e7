//! Server tests over real TCP sockets (h2c with prior knowledge)

mod common;

use common::{demo_server, fetch, response, spawn, TIMEOUT};
use h2push::http::h2::codec::FrameCodec;
use h2push::http::h2::{
    ConnectionEvent, ErrorCode, Frame, H2ServerBuilder, Settings, SettingsBuilder,
};
use h2push::site::{DemoSite, CSS, HTML};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[test]
fn test_all_over_tcp() {
    let server = demo_server();
    let site = server.clone();
    let addr = spawn(server);

    let tcp = TcpStream::connect(addr).unwrap();
    let events = fetch(tcp, Settings::new(), &["/all"], 2);

    assert!(matches!(
        events.first(),
        Some(ConnectionEvent::PushPromise {
            stream_id: 1,
            promised_stream_id: 2,
            ..
        })
    ));
    let (headers, body) = response(&events, 2).unwrap();
    assert_eq!(headers.get("content-type"), Some("text/css"));
    assert_eq!(&body[..], CSS.as_bytes());
    assert_eq!(&response(&events, 1).unwrap().1[..], HTML.as_bytes());
    assert_eq!(site.handler().pushes(), 1);
}

#[test]
fn test_routes_over_tcp() {
    let addr = spawn(demo_server());

    let tcp = TcpStream::connect(addr).unwrap();
    let events = fetch(tcp, Settings::new(), &["/MAIN.CSS", "/nowhere"], 2);
    assert_eq!(&response(&events, 1).unwrap().1[..], CSS.as_bytes());
    let (headers, body) = response(&events, 3).unwrap();
    assert_eq!(headers.status(), Some(200));
    assert_eq!(headers.get("content-type"), Some("text/html"));
    assert_eq!(&body[..], HTML.as_bytes());
}

#[test]
fn test_push_disabled_by_client() {
    let addr = spawn(demo_server());

    let tcp = TcpStream::connect(addr).unwrap();
    let settings = SettingsBuilder::new().enable_push(false).build().unwrap();
    let events = fetch(tcp, settings, &["/all"], 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::PushPromise { .. })));
    assert_eq!(&response(&events, 1).unwrap().1[..], HTML.as_bytes());
}

#[test]
fn test_concurrent_connections() {
    let addr = spawn(demo_server());

    let clients: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(move || {
                let tcp = TcpStream::connect(addr).unwrap();
                fetch(tcp, Settings::new(), &["/all"], 2)
            })
        })
        .collect();
    for client in clients {
        let events = client.join().unwrap();
        assert_eq!(&response(&events, 2).unwrap().1[..], CSS.as_bytes());
    }
}

#[test]
fn test_http1_client_gets_goaway() {
    let addr = spawn(demo_server());

    let mut tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(TIMEOUT)).unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    // A reset after the GOAWAY is fine; keep what arrived
    let mut wire = Vec::new();
    let _ = tcp.read_to_end(&mut wire);

    let mut codec = FrameCodec::new();
    codec.feed(&wire);
    let mut goaway = None;
    while let Some(frame) = codec.next_frame().unwrap() {
        if let Frame::Goaway(g) = frame {
            goaway = Some(g);
        }
    }
    assert_eq!(goaway.unwrap().error_code, ErrorCode::ProtocolError);
}

#[test]
fn test_idle_connection_is_closed() {
    let server = H2ServerBuilder::new(DemoSite::new())
        .read_timeout(Duration::from_millis(200))
        .build();
    let addr = spawn(server);

    let mut tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(TIMEOUT)).unwrap();

    // The server's SETTINGS, then EOF once it gives up on us
    let mut wire = Vec::new();
    tcp.read_to_end(&mut wire).unwrap();
    let mut codec = FrameCodec::new();
    codec.feed(&wire);
    assert!(matches!(codec.next_frame().unwrap(), Some(Frame::Settings(_))));
}
