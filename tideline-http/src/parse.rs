//! HTTP/1.1 head parsers.
//!
//! Pure byte-slice functions with bounded lookahead: each call either
//! yields a complete head plus the number of bytes it consumed, reports
//! that more input is needed, or rejects the input. No partial state is
//! kept between calls — the caller re-presents the accumulated buffer,
//! which is how [`ConnCtx::with_data`](tideline::ConnCtx::with_data)
//! drives parsing.

use crate::error::ParseError;
use crate::request::{Headers, RequestHead, Version};
use crate::response::ResponseHead;

/// Parse a request head (`METHOD SP TARGET SP VERSION CRLF` followed by
/// header lines and a blank line).
///
/// Returns `Ok(Some((head, consumed)))` on a complete head, `Ok(None)`
/// when the terminating blank line has not arrived yet, and `Err` on
/// malformed input. A head that has not terminated within
/// `max_head_bytes` fails with [`ParseError::HeadTooLarge`].
pub fn parse_request_head(
    buf: &[u8],
    max_head_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, ParseError> {
    let Some(head_len) = find_head_end(buf, max_head_bytes)? else {
        return Ok(None);
    };

    let mut lines = HeadLines::new(&buf[..head_len]);
    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;

    let mut parts = request_line.split(|&b| b == b' ');
    let method = parts.next().ok_or(ParseError::BadRequestLine)?;
    let target = parts.next().ok_or(ParseError::BadRequestLine)?;
    let version = parts.next().ok_or(ParseError::BadRequestLine)?;
    if parts.next().is_some() || method.is_empty() || target.is_empty() {
        return Err(ParseError::BadRequestLine);
    }
    if !method.iter().all(|&b| is_tchar(b)) {
        return Err(ParseError::BadRequestLine);
    }

    let head = RequestHead {
        method: ascii_string(method),
        target: ascii_string(target),
        version: parse_version(version)?,
        headers: parse_headers(lines)?,
    };
    Ok(Some((head, head_len)))
}

/// Parse a response head (`VERSION SP STATUS SP REASON CRLF` followed by
/// header lines and a blank line). Same completion contract as
/// [`parse_request_head`].
pub fn parse_response_head(
    buf: &[u8],
    max_head_bytes: usize,
) -> Result<Option<(ResponseHead, usize)>, ParseError> {
    let Some(head_len) = find_head_end(buf, max_head_bytes)? else {
        return Ok(None);
    };

    let mut lines = HeadLines::new(&buf[..head_len]);
    let status_line = lines.next().ok_or(ParseError::BadStatusLine)?;

    // The reason phrase may itself contain spaces (or be absent).
    let mut parts = status_line.splitn(3, |&b| b == b' ');
    let version = parts.next().ok_or(ParseError::BadStatusLine)?;
    let status = parts.next().ok_or(ParseError::BadStatusLine)?;
    let reason = parts.next().unwrap_or(b"");

    if status.len() != 3 || !status.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadStatusLine);
    }
    let mut code: u16 = 0;
    for &b in status {
        code = code * 10 + (b - b'0') as u16;
    }

    let head = ResponseHead {
        version: parse_version(version)?,
        status: code,
        reason: ascii_string(reason),
        headers: parse_headers(lines)?,
    };
    Ok(Some((head, head_len)))
}

/// Locate the end of the head block (the CRLFCRLF terminator), enforcing
/// the size bound. Returns the total head length including the terminator.
fn find_head_end(buf: &[u8], max_head_bytes: usize) -> Result<Option<usize>, ParseError> {
    let window = &buf[..buf.len().min(max_head_bytes)];
    if let Some(pos) = window.windows(4).position(|w| w == b"\r\n\r\n") {
        return Ok(Some(pos + 4));
    }
    // An empty head ("\r\n\r\n" split exactly at the window edge) cannot
    // be missed: the window covers max_head_bytes, and a valid head must
    // terminate within it.
    if buf.len() >= max_head_bytes {
        return Err(ParseError::HeadTooLarge);
    }
    Ok(None)
}

/// Iterator over the CRLF-separated lines of a complete head block,
/// excluding the terminating blank line.
struct HeadLines<'a> {
    rest: &'a [u8],
}

impl<'a> HeadLines<'a> {
    fn new(head: &'a [u8]) -> Self {
        // Strip the final CRLFCRLF; find_head_end guarantees it.
        HeadLines {
            rest: &head[..head.len() - 2],
        }
    }
}

impl<'a> Iterator for HeadLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line = &self.rest[..pos];
                self.rest = &self.rest[pos + 2..];
                Some(line)
            }
            None => {
                let line = self.rest;
                self.rest = &[];
                Some(line)
            }
        }
    }
}

fn parse_headers(lines: HeadLines<'_>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    for line in lines {
        // Obsolete line folding (continuation lines) is rejected rather
        // than unfolded.
        if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            return Err(ParseError::BadHeader);
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::BadHeader)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
            return Err(ParseError::BadHeader);
        }
        let value = trim_ows(&line[colon + 1..]);
        headers.push(ascii_string(name), ascii_string(value));
    }
    Ok(headers)
}

fn parse_version(v: &[u8]) -> Result<Version, ParseError> {
    match v {
        b"HTTP/1.1" => Ok(Version::Http11),
        b"HTTP/1.0" => Ok(Version::Http10),
        _ => Err(ParseError::BadVersion),
    }
}

/// RFC 7230 `tchar`: the characters legal in tokens (methods, header names).
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while v.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        v = &v[1..];
    }
    while v.last().is_some_and(|&b| b == b' ' || b == b'\t') {
        v = &v[..v.len() - 1];
    }
    v
}

fn ascii_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 8 * 1024;

    #[test]
    fn request_head_complete() {
        let buf = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\ntrailing";
        let (head, consumed) = parse_request_head(buf, MAX).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("accept"), Some("*/*"));
        assert_eq!(consumed, buf.len() - "trailing".len());
    }

    #[test]
    fn request_head_incomplete() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
        assert!(parse_request_head(buf, MAX).unwrap().is_none());
    }

    #[test]
    fn header_value_ows_is_trimmed() {
        let buf = b"GET / HTTP/1.1\r\nX-Pad: \t spaced out \t\r\n\r\n";
        let (head, _) = parse_request_head(buf, MAX).unwrap().unwrap();
        assert_eq!(head.headers.get("x-pad"), Some("spaced out"));
    }

    #[test]
    fn duplicate_headers_kept_in_order() {
        let buf = b"GET / HTTP/1.1\r\nA: 1\r\nA: 2\r\n\r\n";
        let (head, _) = parse_request_head(buf, MAX).unwrap().unwrap();
        let all: Vec<&str> = head.headers.get_all("a").collect();
        assert_eq!(all, vec!["1", "2"]);
    }

    #[test]
    fn method_must_be_token() {
        let buf = b"GE T / HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadRequestLine
        );
        let buf = b"G{}T / HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadRequestLine
        );
    }

    #[test]
    fn version_must_be_http_10_or_11() {
        let buf = b"GET / HTTP/2.0\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadVersion
        );
        let buf = b"GET / HTTP/1.0\r\n\r\n";
        let (head, _) = parse_request_head(buf, MAX).unwrap().unwrap();
        assert_eq!(head.version, Version::Http10);
    }

    #[test]
    fn oversized_head_rejected() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        buf.extend_from_slice(b"X-Fill: ");
        buf.extend(std::iter::repeat_n(b'a', 200));
        // No terminator and already past the bound.
        assert_eq!(
            parse_request_head(&buf, 64).unwrap_err(),
            ParseError::HeadTooLarge
        );
    }

    #[test]
    fn complete_head_within_bound_is_accepted() {
        let buf = b"GET / HTTP/1.1\r\n\r\n";
        assert!(parse_request_head(buf, buf.len()).unwrap().is_some());
    }

    #[test]
    fn obsolete_folding_rejected() {
        let buf = b"GET / HTTP/1.1\r\nA: 1\r\n  folded\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadHeader
        );
    }

    #[test]
    fn header_without_colon_rejected() {
        let buf = b"GET / HTTP/1.1\r\nbogus line\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadHeader
        );
    }

    #[test]
    fn header_name_with_trailing_space_rejected() {
        let buf = b"GET / HTTP/1.1\r\nHost : x\r\n\r\n";
        assert_eq!(
            parse_request_head(buf, MAX).unwrap_err(),
            ParseError::BadHeader
        );
    }

    #[test]
    fn response_head_complete() {
        let buf = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (head, consumed) = parse_response_head(buf, MAX).unwrap().unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "Not Found");
        assert_eq!(head.headers.get("content-length"), Some("0"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn response_reason_may_be_empty() {
        let buf = b"HTTP/1.1 200\r\n\r\n";
        let (head, _) = parse_response_head(buf, MAX).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "");
    }

    #[test]
    fn response_status_must_be_three_digits() {
        let buf = b"HTTP/1.1 2x0 OK\r\n\r\n";
        assert_eq!(
            parse_response_head(buf, MAX).unwrap_err(),
            ParseError::BadStatusLine
        );
    }
}
