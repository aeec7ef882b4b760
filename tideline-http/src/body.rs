//! Body framing: Content-Length / chunked / read-until-close.
//!
//! Framing is decided once per message from the parsed head, then a
//! [`BodyReader`] streams the payload out of the connection accumulator
//! without ever reading past the message boundary. The server pipeline
//! watches a shared completion state so it knows exactly when the next
//! pipelined request head begins.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tideline::{ConnCtx, ParseResult};

use crate::error::{HttpError, ParseError};
use crate::request::{Headers, RequestHead};
use crate::response::{ResponseHead, bodyless_status};

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body bytes follow the head.
    None,
    /// Exactly `n` bytes follow.
    Fixed(u64),
    /// Chunked transfer coding; the terminal chunk ends the body.
    Chunked,
    /// The body runs until the peer closes the connection.
    UntilClose,
}

/// Decide the framing of a request body from its head.
///
/// `Transfer-Encoding: chunked` combined with any `Content-Length` is
/// rejected outright, as are multiple differing `Content-Length` values.
pub fn request_body_kind(head: &RequestHead) -> Result<BodyKind, ParseError> {
    let chunked = is_chunked(&head.headers);
    let length = content_length(&head.headers)?;
    match (chunked, length) {
        (true, Some(_)) => Err(ParseError::ChunkedWithLength),
        (true, None) => Ok(BodyKind::Chunked),
        (false, Some(0)) | (false, None) => Ok(BodyKind::None),
        (false, Some(n)) => Ok(BodyKind::Fixed(n)),
    }
}

/// Decide the framing of a response body (client side).
///
/// Responses to HEAD and 1xx/204/304 statuses never carry a body. With
/// neither chunked coding nor a Content-Length, the body runs until the
/// server closes the connection; a keep-alive response without framing
/// headers has no body to wait for.
pub fn response_body_kind(
    head_request: bool,
    head: &ResponseHead,
) -> Result<BodyKind, ParseError> {
    if head_request || bodyless_status(head.status) {
        return Ok(BodyKind::None);
    }
    let chunked = is_chunked(&head.headers);
    let length = content_length(&head.headers)?;
    match (chunked, length) {
        (true, Some(_)) => Err(ParseError::ChunkedWithLength),
        (true, None) => Ok(BodyKind::Chunked),
        (false, Some(0)) => Ok(BodyKind::None),
        (false, Some(n)) => Ok(BodyKind::Fixed(n)),
        (false, None) => {
            if head.is_keep_alive() {
                Ok(BodyKind::None)
            } else {
                Ok(BodyKind::UntilClose)
            }
        }
    }
}

fn is_chunked(headers: &Headers) -> bool {
    headers.has_token("transfer-encoding", "chunked")
}

/// Collapse every `Content-Length` occurrence into one value. Duplicates
/// with the same value are tolerated; disagreement is rejected.
fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all("content-length") {
        // Digits only: `parse` alone would admit a leading `+`, and
        // `trim` would admit Unicode whitespace.
        let digits = value.trim_ascii();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::BadContentLength);
        }
        let n: u64 = digits.parse().map_err(|_| ParseError::BadContentLength)?;
        match seen {
            None => seen = Some(n),
            Some(prev) if prev == n => {}
            Some(_) => return Err(ParseError::ConflictingContentLength),
        }
    }
    Ok(seen)
}

// ── Chunked coding ───────────────────────────────────────────────────

/// One step of chunked-coding decode.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A run of chunk payload bytes (possibly a partial chunk).
    Data(Bytes),
    /// The terminal chunk (and any trailers) have been consumed.
    End,
    /// No progress possible without more input.
    NeedMore,
}

#[derive(Debug, Clone)]
enum ChunkState {
    SizeLine,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

/// Incremental chunked-coding decoder.
///
/// Feed it the front of the accumulator; it reports how many bytes it
/// consumed and what it found. Chunk extensions are ignored; trailers are
/// consumed and discarded.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: ChunkState,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        ChunkDecoder {
            state: ChunkState::SizeLine,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decode as much as possible from `input`. Returns the number of
    /// bytes consumed and the resulting event.
    pub fn decode(&mut self, input: &[u8]) -> Result<(usize, ChunkEvent), ParseError> {
        let mut consumed = 0;
        loop {
            match self.state {
                ChunkState::SizeLine => {
                    let rest = &input[consumed..];
                    let Some(pos) = find_crlf(rest) else {
                        return Ok((consumed, ChunkEvent::NeedMore));
                    };
                    let size = parse_chunk_size(&rest[..pos])?;
                    consumed += pos + 2;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    let rest = &input[consumed..];
                    if rest.is_empty() {
                        return Ok((consumed, ChunkEvent::NeedMore));
                    }
                    let take = (rest.len() as u64).min(remaining) as usize;
                    let data = Bytes::copy_from_slice(&rest[..take]);
                    consumed += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                    return Ok((consumed, ChunkEvent::Data(data)));
                }
                ChunkState::DataEnd => {
                    let rest = &input[consumed..];
                    if rest.len() < 2 {
                        return Ok((consumed, ChunkEvent::NeedMore));
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::BadChunkFraming);
                    }
                    consumed += 2;
                    self.state = ChunkState::SizeLine;
                }
                ChunkState::Trailers => {
                    let rest = &input[consumed..];
                    let Some(pos) = find_crlf(rest) else {
                        return Ok((consumed, ChunkEvent::NeedMore));
                    };
                    let line = &rest[..pos];
                    consumed += pos + 2;
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                        return Ok((consumed, ChunkEvent::End));
                    }
                    // Trailer fields are discarded, but must still look
                    // like header lines.
                    if !line.contains(&b':') {
                        return Err(ParseError::BadChunkFraming);
                    }
                }
                ChunkState::Done => return Ok((consumed, ChunkEvent::End)),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse a chunk-size line: hex digits, optionally followed by
/// `;extension` which is ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = trim_ascii(digits);
    if digits.is_empty() || digits.len() > 16 {
        return Err(ParseError::BadChunkSize);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::BadChunkSize),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(d as u64))
            .ok_or(ParseError::BadChunkSize)?;
    }
    Ok(size)
}

fn trim_ascii(mut v: &[u8]) -> &[u8] {
    while v.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        v = &v[1..];
    }
    while v.last().is_some_and(|&b| b == b' ' || b == b'\t') {
        v = &v[..v.len() - 1];
    }
    v
}

/// Append one chunk frame (`SIZE CRLF data CRLF`) to `out`.
pub fn encode_chunk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append the terminal chunk (`0 CRLF CRLF`) to `out`.
pub fn encode_last_chunk(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

// ── Streaming reader ─────────────────────────────────────────────────

/// Resumable decode position of a partially read body, recovered by the
/// pipeline when a reader is dropped mid-body.
pub(crate) enum BodyProgress {
    Fixed { remaining: u64 },
    Chunked { decoder: ChunkDecoder },
    UntilClose,
}

impl BodyProgress {
    fn from_kind(kind: BodyKind) -> Option<BodyProgress> {
        match kind {
            BodyKind::None | BodyKind::Fixed(0) => None,
            BodyKind::Fixed(n) => Some(BodyProgress::Fixed { remaining: n }),
            BodyKind::Chunked => Some(BodyProgress::Chunked {
                decoder: ChunkDecoder::new(),
            }),
            BodyKind::UntilClose => Some(BodyProgress::UntilClose),
        }
    }
}

/// How a body ended, as observed by the pipeline.
pub(crate) enum BodyOutcome {
    /// The reader consumed the body to its boundary. `force_close` is set
    /// when the connection cannot be reused (UntilClose framing, or the
    /// peer vanished mid-body).
    Completed { force_close: bool },
    /// The reader was dropped before the boundary; the pipeline must
    /// drain the remainder (or close, for UntilClose).
    Abandoned(Option<BodyProgress>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SharedPhase {
    Active,
    Completed,
    Abandoned,
}

/// Completion state shared between a [`BodyReader`] and the pipeline.
pub(crate) struct BodyShared {
    phase: Cell<SharedPhase>,
    force_close: Cell<bool>,
    resume: RefCell<Option<BodyProgress>>,
    waker: RefCell<Option<Waker>>,
}

impl BodyShared {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(BodyShared {
            phase: Cell::new(SharedPhase::Active),
            force_close: Cell::new(false),
            resume: RefCell::new(None),
            waker: RefCell::new(None),
        })
    }

    fn complete(&self, force_close: bool) {
        self.phase.set(SharedPhase::Completed);
        self.force_close.set(force_close);
        self.wake();
    }

    fn abandon(&self, progress: Option<BodyProgress>) {
        self.phase.set(SharedPhase::Abandoned);
        *self.resume.borrow_mut() = progress;
        self.wake();
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Future resolving when the associated body reaches its boundary or is
/// abandoned. Awaited by the server pipeline before parsing the next head.
pub(crate) struct BodyCompletion {
    pub(crate) shared: Rc<BodyShared>,
}

impl Future for BodyCompletion {
    type Output = BodyOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BodyOutcome> {
        match self.shared.phase.get() {
            SharedPhase::Active => {
                *self.shared.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
            SharedPhase::Completed => Poll::Ready(BodyOutcome::Completed {
                force_close: self.shared.force_close.get(),
            }),
            SharedPhase::Abandoned => {
                let progress = self.shared.resume.borrow_mut().take();
                Poll::Ready(BodyOutcome::Abandoned(progress))
            }
        }
    }
}

/// Streaming body reader bound to one message.
///
/// Yields payload slices via [`chunk()`](Self::chunk) and never consumes
/// bytes past the framing boundary, so the next pipelined head stays
/// intact in the accumulator. Dropping the reader before the boundary
/// marks the body abandoned for the pipeline to deal with.
pub struct BodyReader {
    conn: ConnCtx,
    kind: BodyKind,
    progress: Option<BodyProgress>,
    shared: Option<Rc<BodyShared>>,
    finished: bool,
}

impl BodyReader {
    /// Reader wired to a pipeline completion state (server side).
    pub(crate) fn new(conn: ConnCtx, kind: BodyKind, shared: Rc<BodyShared>) -> Self {
        let progress = BodyProgress::from_kind(kind);
        let finished = progress.is_none();
        if finished {
            shared.complete(false);
        }
        BodyReader {
            conn,
            kind,
            progress,
            shared: Some(shared),
            finished,
        }
    }

    /// Standalone reader with no pipeline attached (client side, drains).
    pub(crate) fn detached(conn: ConnCtx, kind: BodyKind) -> Self {
        let progress = BodyProgress::from_kind(kind);
        BodyReader {
            conn,
            kind,
            finished: progress.is_none(),
            progress,
            shared: None,
        }
    }

    pub(crate) fn resume(conn: ConnCtx, progress: BodyProgress) -> Self {
        BodyReader {
            conn,
            kind: BodyKind::None, // kind is irrelevant when resuming a drain
            progress: Some(progress),
            shared: None,
            finished: false,
        }
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    /// Next run of body bytes, or `None` at the boundary.
    ///
    /// A connection that closes before a Fixed or Chunked boundary yields
    /// [`HttpError::ConnectionClosed`].
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        if self.finished {
            return Ok(None);
        }
        match self.progress.as_mut() {
            None => {
                self.finish(false);
                Ok(None)
            }
            Some(BodyProgress::Fixed { .. }) => self.chunk_fixed().await,
            Some(BodyProgress::Chunked { .. }) => self.chunk_chunked().await,
            Some(BodyProgress::UntilClose) => self.chunk_until_close().await,
        }
    }

    /// Read and concatenate the entire remaining body.
    pub async fn bytes(mut self) -> Result<Bytes, HttpError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    async fn chunk_fixed(&mut self) -> Result<Option<Bytes>, HttpError> {
        let Some(BodyProgress::Fixed { remaining }) = self.progress.as_mut() else {
            return Ok(None);
        };
        let limit = *remaining;
        let mut taken: Option<Bytes> = None;
        let n = self
            .conn
            .with_data(|data| {
                let take = (data.len() as u64).min(limit) as usize;
                taken = Some(Bytes::copy_from_slice(&data[..take]));
                ParseResult::Consumed(take)
            })
            .await;
        if n == 0 {
            // Peer closed before the declared length arrived.
            self.finish(true);
            return Err(HttpError::ConnectionClosed);
        }
        *remaining -= n as u64;
        if *remaining == 0 {
            self.finish(false);
        }
        Ok(taken)
    }

    async fn chunk_chunked(&mut self) -> Result<Option<Bytes>, HttpError> {
        loop {
            let Some(BodyProgress::Chunked { decoder }) = self.progress.as_mut() else {
                return Ok(None);
            };
            let outcome: Rc<RefCell<Option<Result<ChunkEvent, ParseError>>>> =
                Rc::new(RefCell::new(None));
            let cell = Rc::clone(&outcome);
            let n = self
                .conn
                .with_data(|data| match decoder.decode(data) {
                    Ok((consumed, event)) => {
                        if consumed == 0 {
                            return ParseResult::NeedMore;
                        }
                        *cell.borrow_mut() = Some(Ok(event));
                        ParseResult::Consumed(consumed)
                    }
                    Err(e) => {
                        // Consume the malformed bytes to resolve the
                        // future; the connection is closing anyway.
                        *cell.borrow_mut() = Some(Err(e));
                        ParseResult::Consumed(data.len())
                    }
                })
                .await;
            let event = outcome.borrow_mut().take();
            match event {
                Some(Err(e)) => {
                    self.finish(true);
                    return Err(HttpError::Parse(e));
                }
                Some(Ok(ChunkEvent::Data(bytes))) => return Ok(Some(bytes)),
                Some(Ok(ChunkEvent::End)) => {
                    self.finish(false);
                    return Ok(None);
                }
                Some(Ok(ChunkEvent::NeedMore)) | None => {
                    if n == 0 {
                        // EOF mid-chunk.
                        self.finish(true);
                        return Err(HttpError::ConnectionClosed);
                    }
                }
            }
        }
    }

    async fn chunk_until_close(&mut self) -> Result<Option<Bytes>, HttpError> {
        let mut taken: Option<Bytes> = None;
        let n = self
            .conn
            .with_data(|data| {
                taken = Some(Bytes::copy_from_slice(data));
                ParseResult::Consumed(data.len())
            })
            .await;
        if n == 0 {
            // EOF is the boundary for this framing; the connection is spent.
            self.finish(true);
            return Ok(None);
        }
        Ok(taken)
    }

    fn finish(&mut self, force_close: bool) {
        self.finished = true;
        self.progress = None;
        if let Some(shared) = &self.shared {
            shared.complete(force_close);
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(shared) = self.shared.take() {
            shared.abandon(self.progress.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Version;

    fn request_head(headers: &[(&str, &str)]) -> RequestHead {
        let mut h = Headers::new();
        for (n, v) in headers {
            h.push(*n, *v);
        }
        RequestHead {
            method: "POST".to_string(),
            target: "/".to_string(),
            version: Version::Http11,
            headers: h,
        }
    }

    fn response_head(version: Version, status: u16, headers: &[(&str, &str)]) -> ResponseHead {
        let mut h = Headers::new();
        for (n, v) in headers {
            h.push(*n, *v);
        }
        ResponseHead {
            version,
            status,
            reason: String::new(),
            headers: h,
        }
    }

    #[test]
    fn request_framing_decision_table() {
        assert_eq!(request_body_kind(&request_head(&[])).unwrap(), BodyKind::None);
        assert_eq!(
            request_body_kind(&request_head(&[("Content-Length", "10")])).unwrap(),
            BodyKind::Fixed(10)
        );
        assert_eq!(
            request_body_kind(&request_head(&[("Content-Length", "0")])).unwrap(),
            BodyKind::None
        );
        assert_eq!(
            request_body_kind(&request_head(&[("Transfer-Encoding", "chunked")])).unwrap(),
            BodyKind::Chunked
        );
    }

    #[test]
    fn chunked_with_length_is_rejected() {
        let head = request_head(&[
            ("Transfer-Encoding", "chunked"),
            ("Content-Length", "10"),
        ]);
        assert_eq!(
            request_body_kind(&head).unwrap_err(),
            ParseError::ChunkedWithLength
        );
    }

    #[test]
    fn differing_content_lengths_rejected_equal_tolerated() {
        let head = request_head(&[("Content-Length", "10"), ("Content-Length", "20")]);
        assert_eq!(
            request_body_kind(&head).unwrap_err(),
            ParseError::ConflictingContentLength
        );

        let head = request_head(&[("Content-Length", "10"), ("Content-Length", "10")]);
        assert_eq!(request_body_kind(&head).unwrap(), BodyKind::Fixed(10));
    }

    #[test]
    fn non_numeric_content_length_rejected() {
        let head = request_head(&[("Content-Length", "ten")]);
        assert_eq!(
            request_body_kind(&head).unwrap_err(),
            ParseError::BadContentLength
        );
    }

    #[test]
    fn content_length_must_be_plain_ascii_digits() {
        // Signs, empty values, and non-ASCII whitespace all fail even
        // though u64::parse or str::trim would let some of them through.
        for value in ["+5", "-5", "", " ", "5\u{a0}", "\u{2009}5", "5_0"] {
            let head = request_head(&[("Content-Length", value)]);
            assert_eq!(
                request_body_kind(&head).unwrap_err(),
                ParseError::BadContentLength,
                "value {value:?} must be rejected"
            );
        }

        // ASCII surrounding whitespace is still tolerated.
        let head = request_head(&[("Content-Length", " 7 ")]);
        assert_eq!(request_body_kind(&head).unwrap(), BodyKind::Fixed(7));
    }

    #[test]
    fn response_framing_decision_table() {
        // HEAD never has a body even with a content-length.
        let head = response_head(Version::Http11, 200, &[("Content-Length", "10")]);
        assert_eq!(response_body_kind(true, &head).unwrap(), BodyKind::None);

        // Bodyless statuses.
        for status in [100, 101, 204, 304] {
            let head = response_head(Version::Http11, status, &[("Content-Length", "10")]);
            assert_eq!(response_body_kind(false, &head).unwrap(), BodyKind::None);
        }

        let head = response_head(Version::Http11, 200, &[("Transfer-Encoding", "chunked")]);
        assert_eq!(response_body_kind(false, &head).unwrap(), BodyKind::Chunked);

        let head = response_head(Version::Http11, 200, &[("Content-Length", "42")]);
        assert_eq!(response_body_kind(false, &head).unwrap(), BodyKind::Fixed(42));

        // No framing headers: body runs to EOF only when the connection
        // will close.
        let head = response_head(Version::Http11, 200, &[("Connection", "close")]);
        assert_eq!(
            response_body_kind(false, &head).unwrap(),
            BodyKind::UntilClose
        );
        let head = response_head(Version::Http11, 200, &[]);
        assert_eq!(response_body_kind(false, &head).unwrap(), BodyKind::None);
        let head = response_head(Version::Http10, 200, &[]);
        assert_eq!(
            response_body_kind(false, &head).unwrap(),
            BodyKind::UntilClose
        );
    }

    #[test]
    fn decode_single_chunk() {
        let mut dec = ChunkDecoder::new();
        let (n, ev) = dec.decode(b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(ev, ChunkEvent::Data(Bytes::from_static(b"hello")));
        assert_eq!(n, 8);
        let (n2, ev) = dec.decode(&b"5\r\nhello\r\n0\r\n\r\n"[n..]).unwrap();
        assert_eq!(ev, ChunkEvent::End);
        assert_eq!(n2, 7);
        assert!(dec.is_done());
    }

    #[test]
    fn decode_across_split_input() {
        let wire = b"6\r\nabcdef\r\n0\r\n\r\n";
        let mut dec = ChunkDecoder::new();
        let mut collected = Vec::new();
        let mut pos = 0;
        let mut end = 0;
        // Reveal the wire one byte at a time; the decoder must make
        // incremental progress and never mis-consume.
        loop {
            if end < wire.len() {
                end += 1;
            }
            let (n, ev) = dec.decode(&wire[pos..end]).unwrap();
            pos += n;
            match ev {
                ChunkEvent::Data(b) => collected.extend_from_slice(&b),
                ChunkEvent::End => break,
                ChunkEvent::NeedMore => assert!(end < wire.len()),
            }
        }
        assert_eq!(collected, b"abcdef");
        assert_eq!(pos, wire.len());
    }

    #[test]
    fn decode_partial_chunk_data_is_yielded_eagerly() {
        let mut dec = ChunkDecoder::new();
        let (n, ev) = dec.decode(b"a\r\n1234").unwrap();
        assert_eq!(n, 7);
        assert_eq!(ev, ChunkEvent::Data(Bytes::from_static(b"1234")));
        let (n, ev) = dec.decode(b"567890\r\n").unwrap();
        // The chunk's trailing CRLF is consumed on the next call.
        assert_eq!(n, 6);
        assert_eq!(ev, ChunkEvent::Data(Bytes::from_static(b"567890")));
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let mut dec = ChunkDecoder::new();
        let (_, ev) = dec.decode(b"3;ext=val\r\nxyz\r\n").unwrap();
        assert_eq!(ev, ChunkEvent::Data(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn trailers_are_consumed() {
        let mut dec = ChunkDecoder::new();
        let wire = b"1\r\nx\r\n0\r\nX-Sum: abc\r\nX-Other: 1\r\n\r\n";
        let (n, ev) = dec.decode(wire).unwrap();
        assert_eq!(ev, ChunkEvent::Data(Bytes::from_static(b"x")));
        let (m, ev) = dec.decode(&wire[n..]).unwrap();
        assert_eq!(ev, ChunkEvent::End);
        assert_eq!(n + m, wire.len());
    }

    #[test]
    fn bad_chunk_size_rejected() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.decode(b"zz\r\n").unwrap_err(),
            ParseError::BadChunkSize
        );
        let mut dec = ChunkDecoder::new();
        assert_eq!(dec.decode(b"\r\n").unwrap_err(), ParseError::BadChunkSize);
    }

    #[test]
    fn missing_data_crlf_rejected() {
        let mut dec = ChunkDecoder::new();
        let (_, _) = dec.decode(b"2\r\nab").unwrap();
        assert_eq!(
            dec.decode(b"xx").unwrap_err(),
            ParseError::BadChunkFraming
        );
    }

    #[test]
    fn encode_round_trip() {
        let mut wire = Vec::new();
        encode_chunk(&mut wire, b"hello world");
        encode_chunk(&mut wire, b"!");
        encode_last_chunk(&mut wire);

        let mut dec = ChunkDecoder::new();
        let mut collected = Vec::new();
        let mut pos = 0;
        loop {
            let (n, ev) = dec.decode(&wire[pos..]).unwrap();
            pos += n;
            match ev {
                ChunkEvent::Data(b) => collected.extend_from_slice(&b),
                ChunkEvent::End => break,
                ChunkEvent::NeedMore => panic!("complete wire reported NeedMore"),
            }
        }
        assert_eq!(collected, b"hello world!");
        assert_eq!(pos, wire.len());
    }

    #[test]
    fn oversized_chunk_size_rejected() {
        let mut dec = ChunkDecoder::new();
        assert_eq!(
            dec.decode(b"fffffffffffffffff\r\n").unwrap_err(),
            ParseError::BadChunkSize
        );
    }
}
