//! tideline-http — HTTP/1.1 on the tideline runtime.
//!
//! The crate layers a complete HTTP/1.1 transport over tideline's
//! readiness-driven connections:
//!
//! - `parse` — pure request/response head parsers with bounded lookahead
//! - `body` — framing decisions (Content-Length / chunked / until-close),
//!   an incremental chunk decoder, and the streaming [`BodyReader`]
//! - `h1_server` — per-connection pipeline: a reader loop plus a FIFO
//!   writer task, with pipelining, `Expect: 100-continue`, and protocol
//!   upgrades
//! - `pool` — bounded two-level (global + per-destination) permit pool
//! - `client` — a small pipelining-free client with a request builder
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tideline_http::{HandlerError, HttpServerBuilder, HttpService, Request, Response};
//!
//! struct Hello;
//!
//! impl HttpService for Hello {
//!     fn create_for_worker(_worker_id: usize) -> Self {
//!         Hello
//!     }
//!
//!     fn call(
//!         &self,
//!         request: Request,
//!     ) -> impl std::future::Future<Output = Result<Response, HandlerError>> + 'static {
//!         async move {
//!             let name = request.target().trim_start_matches('/').to_string();
//!             Ok(Response::new(200).body(format!("hello, {name}")))
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), tideline::Error> {
//!     let config = tideline::Config::default();
//!     let (_shutdown, handles) = HttpServerBuilder::new(config)
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .launch::<Hello>()?;
//!     for h in handles {
//!         h.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod client;
pub mod error;
pub mod h1_server;
pub mod parse;
pub mod pool;
pub mod request;
pub mod response;

/// Body framing of a message.
pub use body::BodyKind;
/// Streaming body reader bounded by the message framing.
pub use body::BodyReader;
/// Incremental chunked-coding decoder.
pub use body::ChunkDecoder;
/// One step of chunked-coding decode.
pub use body::ChunkEvent;
/// Chunk frame encoding helpers.
pub use body::{encode_chunk, encode_last_chunk};
/// Framing decision functions.
pub use body::{request_body_kind, response_body_kind};
/// A parsed response with its body aggregated.
pub use client::ClientResponse;
/// HTTP/1.1 client bound to one connection.
pub use client::HttpClient;
/// Builder for one client request.
pub use client::RequestBuilder;
/// Crate error type.
pub use error::HttpError;
/// Malformed-wire cases.
pub use error::ParseError;
/// Error a handler returns when it cannot produce a response.
pub use h1_server::HandlerError;
/// Builder that launches an [`HttpService`] on tideline workers.
pub use h1_server::HttpServerBuilder;
/// An HTTP request handler, one instance per worker.
pub use h1_server::HttpService;
/// Per-connection pipeline tuning.
pub use h1_server::ServerConfig;
/// Head parsers.
pub use parse::{parse_request_head, parse_response_head};
/// Bounded two-level permit pool.
pub use pool::ConnectionPool;
/// Permit caps for a pool.
pub use pool::PoolLimits;
/// A held two-level permit.
pub use pool::PoolPermit;
/// Ordered, duplicate-preserving header list.
pub use request::Headers;
/// A request handed to a service: head plus streaming body.
pub use request::Request;
/// Parsed request line plus headers.
pub use request::RequestHead;
/// HTTP version of a parsed message.
pub use request::Version;
/// A response produced by a service.
pub use response::Response;
/// Body of a server response.
pub use response::ResponseBody;
/// Parsed status line plus headers.
pub use response::ResponseHead;
/// Boxed upgrade future-factory invoked after a `101` is flushed.
pub use response::UpgradeHandler;
