use std::io;

use thiserror::Error;

/// Errors surfaced by the HTTP client, server pipeline, and pool.
#[derive(Error, Debug)]
pub enum HttpError {
    /// The peer sent bytes that do not form valid HTTP.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The connection closed before a complete message was exchanged.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// No pool permit became available within the acquire deadline.
    #[error("connection pool acquire timed out")]
    PoolTimeout,

    /// The pool was closed while acquiring or holding a permit.
    #[error("connection pool closed")]
    PoolClosed,

    /// A server handler failed before producing a response.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Malformed-wire cases detected by the parsers and body framer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Request line is not `METHOD SP TARGET SP VERSION`.
    #[error("malformed request line")]
    BadRequestLine,

    /// Status line is not `VERSION SP STATUS SP REASON`.
    #[error("malformed status line")]
    BadStatusLine,

    /// Version is neither `HTTP/1.0` nor `HTTP/1.1`.
    #[error("unsupported HTTP version")]
    BadVersion,

    /// Header line without a colon, an illegal name, or obsolete folding.
    #[error("malformed header")]
    BadHeader,

    /// Header block exceeds the configured size bound.
    #[error("header block too large")]
    HeadTooLarge,

    /// `Content-Length` value is not a valid decimal number.
    #[error("invalid content-length")]
    BadContentLength,

    /// Multiple `Content-Length` headers with differing values.
    #[error("conflicting content-length headers")]
    ConflictingContentLength,

    /// Both `Transfer-Encoding: chunked` and `Content-Length` present.
    /// Rejected outright: the two framings disagree about where the
    /// message ends (request smuggling vector).
    #[error("both chunked transfer-encoding and content-length present")]
    ChunkedWithLength,

    /// Chunk size line is not valid hex or is missing its CRLF.
    #[error("invalid chunk size")]
    BadChunkSize,

    /// Chunk data was not followed by CRLF, or a trailer line is malformed.
    #[error("malformed chunked framing")]
    BadChunkFraming,
}
