//! HTTP/1.1 client on a tideline connection.
//!
//! One in-flight request per connection: the client serializes the
//! request, awaits transmission, then parses the response head and
//! aggregates the body according to its framing (including bodies that
//! run until the server closes). Use a [`ConnectionPool`] to bound how
//! many such connections exist.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tideline::{ConnCtx, ParseResult};

use crate::body::{BodyKind, BodyReader, response_body_kind};
use crate::error::{HttpError, ParseError};
use crate::parse::parse_response_head;
use crate::pool::{ConnectionPool, PoolPermit};
use crate::response::ResponseHead;

const MAX_RESPONSE_HEAD_BYTES: usize = 16 * 1024;

/// A parsed response with its body aggregated.
pub struct ClientResponse {
    head: ResponseHead,
    body: Bytes,
}

impl ClientResponse {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// HTTP/1.1 client bound to one connection.
///
/// # Example
///
/// ```rust,ignore
/// let mut client = HttpClient::connect(addr, "example.com").await?;
/// let resp = client.get("/api/data").header("accept", "text/plain").send().await?;
/// assert_eq!(resp.status(), 200);
/// ```
pub struct HttpClient {
    conn: ConnCtx,
    host: String,
    /// Held for the connection's lifetime when pool-acquired.
    permit: Option<PoolPermit>,
    /// Set once the server signalled (or framing implied) no reuse.
    spent: bool,
}

impl HttpClient {
    /// Connect to `addr`. `host` fills the `Host` header of every request.
    ///
    /// Must be called from within the tideline executor.
    pub async fn connect(addr: SocketAddr, host: &str) -> Result<Self, HttpError> {
        let conn = tideline::connect(addr)?.await?;
        Ok(HttpClient {
            conn,
            host: host.to_string(),
            permit: None,
            spent: false,
        })
    }

    /// Connect with a deadline. Times out with [`HttpError::Timeout`].
    pub async fn connect_with_timeout(
        addr: SocketAddr,
        host: &str,
        timeout_ms: u64,
    ) -> Result<Self, HttpError> {
        let conn = tideline::connect_with_timeout(addr, timeout_ms)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    HttpError::Timeout
                } else {
                    HttpError::Io(e)
                }
            })?;
        Ok(HttpClient {
            conn,
            host: host.to_string(),
            permit: None,
            spent: false,
        })
    }

    /// Acquire a permit from `pool`, then connect. The permit is held
    /// until the client is dropped (or [`close`](Self::close)d); a
    /// failed connect hands it straight back.
    pub async fn connect_pooled(
        pool: &ConnectionPool,
        addr: SocketAddr,
        host: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, HttpError> {
        let permit = pool.acquire(addr, acquire_timeout).await?;
        let mut client = Self::connect(addr, host).await?;
        client.permit = Some(permit);
        Ok(client)
    }

    /// Build a GET request.
    pub fn get(&mut self, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, "GET", path)
    }

    /// Build a POST request.
    pub fn post(&mut self, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, "POST", path)
    }

    /// Build a PUT request.
    pub fn put(&mut self, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, "PUT", path)
    }

    /// Build a DELETE request.
    pub fn delete(&mut self, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, "DELETE", path)
    }

    /// Build a HEAD request.
    pub fn head(&mut self, path: &str) -> RequestBuilder<'_> {
        RequestBuilder::new(self, "HEAD", path)
    }

    /// Whether the connection can carry another request.
    pub fn is_reusable(&self) -> bool {
        !self.spent
    }

    /// Close the connection and hand any pool permit back.
    pub fn close(&mut self) {
        self.spent = true;
        self.conn.close();
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }

    pub(crate) async fn send_request(
        &mut self,
        method: &str,
        path: &str,
        extra_headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<ClientResponse, HttpError> {
        if self.spent {
            return Err(HttpError::ConnectionClosed);
        }

        let wire = serialize_request(method, path, &self.host, extra_headers, body);
        self.conn
            .send(&wire)
            .map_err(send_error)?
            .await
            .map_err(io_error)?;

        let head = self.read_response_head().await?;
        let kind = response_body_kind(method.eq_ignore_ascii_case("HEAD"), &head)?;
        let body = BodyReader::detached(self.conn, kind).bytes().await?;

        if !head.is_keep_alive() || kind == BodyKind::UntilClose {
            self.close();
        }

        Ok(ClientResponse { head, body })
    }

    async fn read_response_head(&mut self) -> Result<ResponseHead, HttpError> {
        let mut outcome: Option<Result<ResponseHead, ParseError>> = None;
        let n = self
            .conn
            .with_data(
                |data| match parse_response_head(data, MAX_RESPONSE_HEAD_BYTES) {
                    Ok(Some((head, consumed))) => {
                        outcome = Some(Ok(head));
                        ParseResult::Consumed(consumed)
                    }
                    Ok(None) => ParseResult::NeedMore,
                    Err(e) => {
                        outcome = Some(Err(e));
                        ParseResult::Consumed(data.len())
                    }
                },
            )
            .await;
        match outcome {
            Some(Ok(head)) => Ok(head),
            Some(Err(e)) => {
                self.close();
                Err(HttpError::Parse(e))
            }
            None => {
                debug_assert_eq!(n, 0);
                self.close();
                Err(HttpError::ConnectionClosed)
            }
        }
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }
}

fn serialize_request(
    method: &str,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut wire = Vec::with_capacity(256 + body.map_or(0, <[u8]>::len));
    wire.extend_from_slice(method.as_bytes());
    wire.push(b' ');
    wire.extend_from_slice(path.as_bytes());
    wire.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    wire.extend_from_slice(host.as_bytes());
    wire.extend_from_slice(b"\r\n");
    for (name, value) in extra_headers {
        wire.extend_from_slice(name.as_bytes());
        wire.extend_from_slice(b": ");
        wire.extend_from_slice(value.as_bytes());
        wire.extend_from_slice(b"\r\n");
    }
    if let Some(body) = body {
        let has_length = extra_headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
        if !has_length {
            wire.extend_from_slice(b"content-length: ");
            wire.extend_from_slice(body.len().to_string().as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(body);
    } else {
        wire.extend_from_slice(b"\r\n");
    }
    wire
}

fn send_error(e: tideline::Error) -> HttpError {
    match e {
        tideline::Error::InvalidConnection | tideline::Error::ClosedChannel => {
            HttpError::ConnectionClosed
        }
        tideline::Error::Io(e) => HttpError::Io(e),
        other => HttpError::Io(io::Error::other(other.to_string())),
    }
}

fn io_error(e: io::Error) -> HttpError {
    if e.kind() == io::ErrorKind::ConnectionAborted {
        HttpError::ConnectionClosed
    } else {
        HttpError::Io(e)
    }
}

/// Builder for one request on an [`HttpClient`].
pub struct RequestBuilder<'a> {
    client: &'a mut HttpClient,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl<'a> RequestBuilder<'a> {
    fn new(client: &'a mut HttpClient, method: &str, path: &str) -> Self {
        RequestBuilder {
            client,
            method: method.to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the request body. Content-Length is added automatically.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Send the request and await the full response.
    pub async fn send(self) -> Result<ClientResponse, HttpError> {
        let extra: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        self.client
            .send_request(
                &self.method,
                &self.path,
                &extra,
                self.body.as_deref(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_and_host_header() {
        let wire = serialize_request("GET", "/x/y", "example.com", &[], None);
        let s = String::from_utf8(wire).unwrap();
        assert_eq!(s, "GET /x/y HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }

    #[test]
    fn body_adds_content_length() {
        let wire = serialize_request("POST", "/", "h", &[("x-a", "1")], Some(b"hello"));
        let s = String::from_utf8(wire).unwrap();
        assert_eq!(
            s,
            "POST / HTTP/1.1\r\nhost: h\r\nx-a: 1\r\ncontent-length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn explicit_content_length_not_duplicated() {
        let wire = serialize_request("POST", "/", "h", &[("Content-Length", "5")], Some(b"hello"));
        let s = String::from_utf8(wire).unwrap();
        assert_eq!(s.matches("ontent-").count(), 1);
    }
}
