//! HPACK interoperability with the `hpack` crate
//!
//! Blocks are encoded on one side and decoded on the other, several in a
//! row so both dynamic tables have to stay in step.

use h2push::http::h2::hpack::{Decoder, Encoder};
use h2push::http::h2::HeaderBlock;

fn request(path: &str) -> HeaderBlock {
    HeaderBlock::new()
        .with(":method", "GET")
        .with(":scheme", "https")
        .with(":path", path)
        .with(":authority", "www.example.com")
        .with("user-agent", "h2push-interop/1.0")
        .with("accept", "text/html,text/css")
}

fn pairs(block: &HeaderBlock) -> Vec<(Vec<u8>, Vec<u8>)> {
    block
        .iter()
        .map(|f| (f.name.clone().into_bytes(), f.value.clone().into_bytes()))
        .collect()
}

#[test]
fn test_our_encoder_their_decoder() {
    let mut encoder = Encoder::new();
    let mut decoder = hpack::Decoder::new();

    for path in ["/", "/all", "/main.css", "/all"] {
        let block = request(path);
        let wire = encoder.encode(&block);
        let decoded = decoder.decode(&wire).unwrap();
        assert_eq!(decoded, pairs(&block), "path {}", path);
    }
}

#[test]
fn test_their_encoder_our_decoder() {
    let mut encoder = hpack::Encoder::new();
    let mut decoder = Decoder::with_max_table_size(4096);

    for path in ["/index.html", "/main.css", "/index.html"] {
        let block = request(path);
        let owned = pairs(&block);
        let wire = encoder.encode(owned.iter().map(|(n, v)| (&n[..], &v[..])));
        let decoded = decoder.decode(&wire).unwrap();
        assert_eq!(decoded, block, "path {}", path);
    }
}

#[test]
fn test_response_headers_and_sensitive_values() {
    let mut encoder = Encoder::new();
    let mut decoder = hpack::Decoder::new();

    let block = HeaderBlock::new()
        .with(":status", "200")
        .with("content-type", "text/css")
        .with("content-length", "81")
        .with_sensitive("set-cookie", "session=0123456789abcdef");
    for _ in 0..2 {
        let decoded = decoder.decode(&encoder.encode(&block)).unwrap();
        assert_eq!(decoded, pairs(&block));
    }
}

#[test]
fn test_large_values_overflowing_the_table() {
    let mut encoder = Encoder::new();
    let mut decoder = hpack::Decoder::new();

    let block = request("/").with("x-padding", "z".repeat(5000));
    let decoded = decoder.decode(&encoder.encode(&block)).unwrap();
    assert_eq!(decoded, pairs(&block));

    // The table was flushed; later blocks still decode
    let block = request("/after");
    let decoded = decoder.decode(&encoder.encode(&block)).unwrap();
    assert_eq!(decoded, pairs(&block));
}
