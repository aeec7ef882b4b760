//! tideline — epoll-based async I/O runtime for Linux.
//!
//! A thread-per-core transport with no work stealing: every worker owns
//! a `SO_REUSEPORT` listener, an epoll instance, and each connection the
//! kernel hands it, and drives them all from one single-threaded
//! executor. Handlers are plain `async` code over [`ConnCtx`]; readiness
//! events, timers, and wakeups never leave the worker thread.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tideline::{Config, ConnCtx, ConnectionHandler, ParseResult, TidelineBuilder};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_accept(&self, conn: ConnCtx) -> impl std::future::Future<Output = ()> + 'static {
//!         async move {
//!             loop {
//!                 let n = conn
//!                     .with_data(|data| {
//!                         conn.send_nowait(data).ok();
//!                         ParseResult::Consumed(data.len())
//!                     })
//!                     .await;
//!                 if n == 0 {
//!                     break;
//!                 }
//!             }
//!         }
//!     }
//!     fn create_for_worker(_id: usize) -> Self {
//!         Echo
//!     }
//! }
//!
//! fn main() -> Result<(), tideline::Error> {
//!     let (_shutdown, handles) = TidelineBuilder::new(Config::default())
//!         .bind("127.0.0.1:7878".parse().unwrap())
//!         .launch::<Echo>()?;
//!     for h in handles {
//!         h.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: epoll, eventfd, `SO_REUSEPORT`, and `accept4`.

pub(crate) mod buffer;
pub(crate) mod connection;
pub(crate) mod driver;
pub(crate) mod event_loop;
pub(crate) mod metrics;
pub(crate) mod poller;
pub(crate) mod runtime;
pub(crate) mod worker;

pub mod config;
pub mod error;

pub use config::{Config, ConfigBuilder, WorkerConfig};
pub use error::{Error, TimerExhausted};
pub use runtime::handler::ConnectionHandler;
pub use runtime::io::{
    ConnCtx, ConnectFuture, Elapsed, ParseResult, SendFuture, SleepFuture, TimeoutFuture,
    WithDataFuture, connect, connect_with_timeout, remote_waker, request_shutdown, sleep,
    sleep_until, spawn, timeout, timeout_at, try_sleep, try_sleep_until, try_timeout,
    try_timeout_at,
};
pub use runtime::task::TaskId;
pub use worker::{ShutdownHandle, TidelineBuilder};
