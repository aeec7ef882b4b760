//! Response-side types and the server serializer.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tideline::ConnCtx;

use crate::body::{encode_chunk, encode_last_chunk};
use crate::request::{Headers, Version};

/// Parsed status line plus headers (client side). Immutable once parsed.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Keep-alive decision for the response, mirroring the request rule.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

/// Body of a server response.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// Each element becomes one chunk on the wire.
    Chunked(Vec<Bytes>),
}

/// Factory invoked after a `101` response has been flushed: receives the
/// raw connection (any bytes the client sent past the request head are
/// still buffered) and takes over the wire for the switched protocol.
pub type UpgradeHandler = Box<dyn FnOnce(ConnCtx) -> Pin<Box<dyn Future<Output = ()>>>>;

/// A response produced by an [`HttpService`](crate::HttpService).
pub struct Response {
    status: u16,
    headers: Headers,
    body: ResponseBody,
    upgrade: Option<UpgradeHandler>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: ResponseBody::Empty,
            upgrade: None,
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    /// Set a fixed-length body. Content-Length is added at serialization
    /// time unless already present.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Bytes(body.into());
        self
    }

    /// Set a chunk-encoded body; each element is framed as one chunk.
    pub fn chunked(mut self, chunks: Vec<Bytes>) -> Self {
        self.body = ResponseBody::Chunked(chunks);
        self
    }

    /// Attach an upgrade handler. After the response head (typically a
    /// `101 Switching Protocols`) is flushed, HTTP framing stops and the
    /// handler receives the raw connection.
    pub fn upgrade<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ConnCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.upgrade = Some(Box::new(move |conn| Box::pin(f(conn))));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// In-place header append for the writer (connection tokens).
    pub(crate) fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(name, value);
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<UpgradeHandler> {
        self.upgrade.take()
    }
}

/// Whether a response with this status never carries a body.
pub(crate) fn bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Serialize a response: status line, headers, framing headers, body.
///
/// `head_request` suppresses the body bytes (HEAD semantics) while still
/// emitting the framing headers the equivalent GET would have carried.
pub(crate) fn serialize_response(out: &mut Vec<u8>, resp: &Response, head_request: bool) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(resp.status.to_string().as_bytes());
    let reason = reason_phrase(resp.status);
    if !reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    let no_body = bodyless_status(resp.status);
    let have_framing =
        resp.headers.contains("content-length") || resp.headers.contains("transfer-encoding");

    match &resp.body {
        ResponseBody::Empty => {
            if !no_body && !have_framing {
                out.extend_from_slice(b"content-length: 0\r\n");
            }
            out.extend_from_slice(b"\r\n");
        }
        ResponseBody::Bytes(bytes) => {
            if !no_body && !have_framing {
                out.extend_from_slice(b"content-length: ");
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            if !no_body && !head_request {
                out.extend_from_slice(bytes);
            }
        }
        ResponseBody::Chunked(chunks) => {
            if !no_body && !have_framing {
                out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
            out.extend_from_slice(b"\r\n");
            if !no_body && !head_request {
                for chunk in chunks {
                    if !chunk.is_empty() {
                        encode_chunk(out, chunk);
                    }
                }
                encode_last_chunk(out);
            }
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
