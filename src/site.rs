//! Demo site
//!
//! Three routes, matched case-insensitively:
//!
//! - `/all` pushes `/main.css`, then answers with the HTML page
//! - `/main.css` answers with the stylesheet
//! - anything else answers with the HTML page

use crate::http::h2::{ErrorCode, Handler, HeaderBlock, Request, Responder, StreamId};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub const HTML: &str = "<html>\n\
<head><title>ChanakaDKB</title><link rel=\"stylesheet\" type=\"text/css\" href=\"main.css\"></head>\n\
<body><h1>https://medium.com/@chanakadkb</h1></body>\n\
</html>";

pub const CSS: &str = "h1 {\n    color: white;\n    text-align: center;\n    background-color: lightblue;\n}";

pub const STYLESHEET_PATH: &str = "/main.css";

/// Handler serving the canned page and stylesheet
#[derive(Debug, Default)]
pub struct DemoSite {
    pushes: AtomicU64,
    aborted: AtomicU64,
}

impl DemoSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stylesheets pushed so far
    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Streams that ended abnormally so far
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    fn html_headers() -> HeaderBlock {
        HeaderBlock::new()
            .with(":status", "200")
            .with("content-type", "text/html")
            .with("content-length", HTML.len().to_string())
    }

    fn css_headers() -> HeaderBlock {
        HeaderBlock::new()
            .with(":status", "200")
            .with("content-type", "text/css")
            .with("content-length", CSS.len().to_string())
    }

    /// Request the client would have sent for the stylesheet
    fn stylesheet_request(parent: &Request) -> HeaderBlock {
        let mut headers = HeaderBlock::new()
            .with(":method", "GET")
            .with(":scheme", parent.headers().scheme().unwrap_or("http"))
            .with(":path", STYLESHEET_PATH);
        if let Some(authority) = parent.headers().authority() {
            headers.push(":authority", authority);
        }
        headers
    }

    fn serve_all(&self, request: &Request, responder: &mut Responder<'_>) {
        if responder.push_enabled() {
            match responder.push_promise(
                Self::stylesheet_request(request),
                Self::css_headers(),
                Bytes::from_static(CSS.as_bytes()),
            ) {
                Ok(Some(promised)) => {
                    self.pushes.fetch_add(1, Ordering::Relaxed);
                    debug!(parent = request.stream_id(), promised, "pushed stylesheet");
                }
                Ok(None) => debug!("client refused the push"),
                Err(e) => warn!(error = %e, "push failed"),
            }
        }
        respond(responder, Self::html_headers(), HTML);
    }
}

fn respond(responder: &mut Responder<'_>, headers: HeaderBlock, body: &'static str) {
    if let Err(e) = responder.send_response(headers, Bytes::from_static(body.as_bytes()), true) {
        warn!(stream_id = responder.stream_id(), error = %e, "response failed");
    }
}

impl Handler for DemoSite {
    fn on_request(&self, request: Request, responder: &mut Responder<'_>) {
        let path = request.path();
        info!(stream_id = request.stream_id(), method = request.method(), path, "serving");

        if path.eq_ignore_ascii_case("/all") {
            self.serve_all(&request, responder);
        } else if path.eq_ignore_ascii_case(STYLESHEET_PATH) {
            respond(responder, Self::css_headers(), CSS);
        } else {
            respond(responder, Self::html_headers(), HTML);
        }
    }

    fn on_stream_aborted(&self, stream_id: StreamId, code: ErrorCode) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(stream_id, %code, "stream aborted");
    }
}
