use std::io;

use thiserror::Error;

/// Errors returned by the tideline driver.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or poller operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Poller setup failed (epoll/eventfd creation, invalid config).
    #[error("poller setup: {0}")]
    PollerSetup(String),
    /// Every connection slot on this worker is occupied.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Invalid connection handle (stale or out of range).
    #[error("invalid connection")]
    InvalidConnection,
    /// Per-connection outbound buffer is at its configured limit.
    #[error("send buffer full")]
    SendBufferFull,
    /// An OS limit (RLIMIT_NOFILE) is below what the worker set needs.
    #[error("{0}")]
    ResourceLimit(String),
    /// The connection (or the whole worker) was closed while an operation
    /// was pending.
    #[error("channel closed")]
    ClosedChannel,
}

/// The timer table had no free slot; returned by
/// [`try_sleep`](crate::try_sleep) and [`try_timeout`](crate::try_timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timer table exhausted")]
pub struct TimerExhausted;
