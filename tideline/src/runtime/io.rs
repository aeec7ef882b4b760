//! Async I/O surface: the `ConnCtx` handle, its futures, and the free
//! functions available inside a worker (spawn, connect, sleep, timeout).
//!
//! Everything here runs on the worker thread that owns the connection.
//! Futures reach the driver and executor through a thread-local poll
//! scope instead of holding references, which keeps the handles `Copy`
//! and the futures allocation-free.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::error::TimerExhausted;
use crate::runtime::task::TaskId;
use crate::runtime::{CURRENT_TASK_ID, Executor};

/// Verdict returned by a parse closure passed to [`ConnCtx::with_data`].
///
/// `NeedMore` (and `Consumed(0)` on a non-empty buffer) parks the future
/// until the socket delivers more bytes. At EOF the `with_data` future
/// resolves with `0` whatever the closure last answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// `n` bytes were consumed and may be discarded from the buffer.
    ///
    /// `Consumed(0)` on non-empty input means the same as [`NeedMore`]:
    /// the closure runs again once more bytes have accumulated.
    ///
    /// [`NeedMore`]: ParseResult::NeedMore
    Consumed(usize),
    /// The buffered bytes do not yet form a complete unit.
    NeedMore,
}

/// Worker state reachable from futures while the executor polls them.
///
/// # Safety
///
/// The pointers are dereferenced only between `enter_poll_scope` and
/// `exit_poll_scope`, which bracket a poll batch on the worker thread
/// while the driver and executor sit live in `EventLoop::run` above.
/// Nothing crosses threads: the scope cell is thread-local.
pub(crate) struct PollScope {
    pub(crate) driver: *mut Driver,
    pub(crate) executor: *mut Executor,
}

thread_local! {
    static SCOPE: Cell<*mut PollScope> = const { Cell::new(std::ptr::null_mut()) };
}

/// Publish the worker's driver and executor for the duration of a poll batch.
pub(crate) fn enter_poll_scope(scope: *mut PollScope) {
    SCOPE.set(scope);
}

/// Retract the poll scope once the batch is done.
pub(crate) fn exit_poll_scope() {
    SCOPE.set(std::ptr::null_mut());
}

/// Run `f` with the worker's driver and executor, or `None` when the
/// calling thread is not inside a poll scope.
fn try_with_worker<R>(f: impl FnOnce(&mut Driver, &mut Executor) -> R) -> Option<R> {
    let ptr = SCOPE.get();
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null only inside a poll batch on this thread; see PollScope.
    let scope = unsafe { &mut *ptr };
    let driver = unsafe { &mut *scope.driver };
    let executor = unsafe { &mut *scope.executor };
    Some(f(driver, executor))
}

/// Like [`try_with_worker`], but panics when called from a foreign thread.
fn with_worker<R>(f: impl FnOnce(&mut Driver, &mut Executor) -> R) -> R {
    try_with_worker(f).expect("not inside a tideline worker")
}

fn current_task() -> u32 {
    CURRENT_TASK_ID.with(|c| c.get())
}

fn outside_worker() -> io::Error {
    io::Error::other("not inside a tideline worker")
}

/// Spawn a standalone async task on the current worker.
///
/// Standalone tasks have no connection of their own; they share the
/// worker's single-threaded executor with the connection tasks and may
/// sleep, set timeouts, dial out, or drive I/O on any `ConnCtx` they
/// were handed.
///
/// Returns `Err` when called from a foreign thread or when the worker's
/// standalone task table is full.
pub fn spawn(future: impl Future<Output = ()> + 'static) -> io::Result<TaskId> {
    try_with_worker(|_driver, executor| {
        match executor.tasks.spawn_standalone(Box::pin(future)) {
            Some(task_id) => {
                executor.ready_queue.push_back(task_id);
                Ok(TaskId(task_id))
            }
            None => Err(io::Error::other("standalone task table full")),
        }
    })
    .unwrap_or_else(|| Err(outside_worker()))
}

impl TaskId {
    /// Cancel a standalone task, dropping its future on the spot.
    ///
    /// A completed task makes this a no-op. Timers the dropped future
    /// held are released through their own `Drop`; a stale entry left
    /// in the ready queue is skipped when the executor reaches it.
    ///
    /// # Panics
    ///
    /// Panics when called from outside the task's worker.
    pub fn cancel(self) {
        with_worker(|_driver, executor| {
            executor.tasks.remove(self.0);
        });
    }
}

/// Dial an outbound TCP connection from any task on this worker.
///
/// The nonblocking connect starts immediately; the returned
/// [`ConnectFuture`] resolves with a [`ConnCtx`] once the socket is
/// established. Use this form where no `ConnCtx` is in scope, such as a
/// standalone task or an
/// [`on_start`](crate::ConnectionHandler::on_start) future.
///
/// # Panics
///
/// Panics when called from a foreign thread.
pub fn connect(addr: SocketAddr) -> io::Result<ConnectFuture> {
    with_worker(|driver, executor| {
        let (conn_index, generation) = driver
            .connect(addr)
            .map_err(|e| io::Error::other(e.to_string()))?;
        executor.connect_waiters[conn_index as usize] = Some(current_task());
        Ok(ConnectFuture {
            conn_index,
            generation,
            done: false,
        })
    })
}

/// Dial an outbound TCP connection, abandoning it after `timeout_ms`.
///
/// On expiry the half-open socket is torn down and its slot returned
/// before `ErrorKind::TimedOut` comes back.
///
/// # Panics
///
/// Panics when called from a foreign thread.
pub async fn connect_with_timeout(addr: SocketAddr, timeout_ms: u64) -> io::Result<ConnCtx> {
    let fut = connect(addr)?;
    match timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        // ConnectFuture::drop already reclaimed the slot.
        Err(Elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// Create a [`Waker`](std::task::Waker) for the current task that may be
/// invoked from any thread.
///
/// The wakers the executor itself hands out are thread-bound (they push
/// onto a thread-local queue without allocating). Code that parks a task
/// behind state shared across workers, like a connection pool's permit
/// queue, must capture one of these instead: waking sends the task ID
/// over the worker's wake channel and interrupts its poller.
///
/// Returns `None` when called from a foreign thread.
pub fn remote_waker() -> Option<std::task::Waker> {
    try_with_worker(|driver, executor| {
        std::task::Waker::from(std::sync::Arc::new(RemoteWake {
            task_id: current_task(),
            tx: executor.remote_tx.clone(),
            poller: driver.registrations.clone(),
        }))
    })
}

struct RemoteWake {
    task_id: u32,
    tx: crossbeam_channel::Sender<u32>,
    poller: crate::poller::RegistrationQueue,
}

impl std::task::Wake for RemoteWake {
    fn wake(self: std::sync::Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &std::sync::Arc<Self>) {
        // Send fails only once the worker has exited; the wake is moot then.
        let _ = self.tx.send(self.task_id);
        self.poller.wake();
    }
}

/// Ask the current worker's event loop to shut down gracefully.
///
/// Free-function form of [`ConnCtx::request_shutdown`] for tasks that
/// hold no `ConnCtx`. Returns `Err` when called from a foreign thread.
pub fn request_shutdown() -> io::Result<()> {
    try_with_worker(|driver, _| {
        driver.request_shutdown();
    })
    .ok_or_else(outside_worker)
}

/// Handle to one connection, given to
/// [`ConnectionHandler::on_accept`](crate::ConnectionHandler::on_accept)
/// and returned by [`connect`].
///
/// Reading goes through [`with_data`](Self::with_data) /
/// [`try_with_data`](Self::try_with_data), writing through
/// [`send`](Self::send) / [`send_nowait`](Self::send_nowait); the handle
/// can also dial further connections and close itself.
///
/// `ConnCtx` is `Copy`: it carries a slot index plus a generation stamp,
/// and a handle that outlives its connection fails with
/// [`Error::InvalidConnection`](crate::Error::InvalidConnection) rather
/// than touching whatever reused the slot.
#[derive(Clone, Copy)]
pub struct ConnCtx {
    pub(crate) conn_index: u32,
    pub(crate) generation: u32,
}

impl ConnCtx {
    pub(crate) fn new(conn_index: u32, generation: u32) -> Self {
        ConnCtx {
            conn_index,
            generation,
        }
    }

    /// Slot index of this connection, stable for its lifetime. Handy as
    /// a key into per-connection side tables.
    pub fn index(&self) -> usize {
        self.conn_index as usize
    }

    // ── Recv ─────────────────────────────────────────────────────────

    /// Wait for buffered bytes and hand them to `parse`.
    ///
    /// The closure sees everything accumulated so far and answers with a
    /// [`ParseResult`]. Answering `Consumed(n)` with `n > 0` resolves the
    /// future with `n`; `NeedMore` (or `Consumed(0)` on non-empty input)
    /// parks it until the next readable event, so the closure must
    /// tolerate re-running (`FnMut`). Bytes already buffered resolve the
    /// future on its first poll without touching the poller.
    ///
    /// Resolves with `0` once the peer has shut down and no complete
    /// unit can ever form.
    pub fn with_data<F: FnMut(&[u8]) -> ParseResult>(&self, parse: F) -> WithDataFuture<F> {
        WithDataFuture {
            conn_index: self.conn_index,
            parser: Some(parse),
        }
    }

    /// Synchronous peek at the accumulator. Runs `parse` over the
    /// buffered bytes and applies any consumption, or returns `None`
    /// when nothing is buffered.
    pub fn try_with_data<F: FnOnce(&[u8]) -> ParseResult>(&self, parse: F) -> Option<ParseResult> {
        with_worker(|driver, _executor| {
            let buffered = driver.accumulators.data(self.conn_index);
            if buffered.is_empty() {
                return None;
            }
            let verdict = parse(buffered);
            if let ParseResult::Consumed(n) = verdict {
                driver.accumulators.consume(self.conn_index, n);
            }
            Some(verdict)
        })
    }

    // ── Send ─────────────────────────────────────────────────────────

    /// Fire-and-forget send. Stages `data` in the outbound buffer and
    /// writes whatever the socket takes right now; the driver drains the
    /// rest as the socket turns writable.
    ///
    /// # Errors
    ///
    /// [`Error::SendBufferFull`](crate::Error::SendBufferFull) when the
    /// staged backlog would exceed its limit,
    /// [`Error::InvalidConnection`](crate::Error::InvalidConnection) for
    /// a stale handle. Use [`send`](Self::send) when backpressure matters.
    pub fn send_nowait(&self, data: &[u8]) -> Result<(), crate::error::Error> {
        with_worker(|driver, executor| {
            driver.stage_send(executor, self.conn_index, self.generation, data)
        })
    }

    /// Send with backpressure. Stages `data` eagerly like
    /// [`send_nowait`](Self::send_nowait), then hands back a future that
    /// resolves with the byte count once the outbound buffer has fully
    /// drained into the kernel, or with the connection's failure.
    pub fn send(&self, data: &[u8]) -> Result<SendFuture, crate::error::Error> {
        with_worker(|driver, executor| {
            driver.stage_send(executor, self.conn_index, self.generation, data)?;
            Ok(SendFuture {
                conn_index: self.conn_index,
                generation: self.generation,
                len: data.len(),
            })
        })
    }

    // ── Connect ──────────────────────────────────────────────────────

    /// Dial an outbound TCP connection; resolves with a `ConnCtx` for
    /// the new peer.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<ConnectFuture> {
        connect(addr)
    }

    /// Dial an outbound TCP connection, abandoning it after `timeout_ms`.
    pub async fn connect_with_timeout(
        &self,
        addr: SocketAddr,
        timeout_ms: u64,
    ) -> io::Result<ConnCtx> {
        connect_with_timeout(addr, timeout_ms).await
    }

    // ── Shutdown / close / metadata ──────────────────────────────────

    /// Ask this worker's event loop to shut down gracefully.
    pub fn request_shutdown(&self) {
        with_worker(|driver, _| {
            driver.request_shutdown();
        })
    }

    /// Close the connection: deregister from the poller, close the fd,
    /// and fail any task parked on it. Idempotent; a stale handle is a
    /// no-op, as is calling from a foreign thread.
    pub fn close(&self) {
        try_with_worker(|driver, executor| {
            if self.is_live(driver) {
                driver.close_connection(executor, self.conn_index);
            }
        });
    }

    /// Peer address, or `None` for a stale handle.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        with_worker(|driver, _| {
            driver
                .connections
                .get(self.conn_index)
                .filter(|c| c.generation == self.generation)
                .and_then(|c| c.peer_addr)
        })
    }

    /// Whether this connection was dialed out rather than accepted.
    pub fn is_outbound(&self) -> bool {
        with_worker(|driver, _| {
            driver
                .connections
                .get(self.conn_index)
                .is_some_and(|c| c.generation == self.generation && c.outbound)
        })
    }

    fn is_live(&self, driver: &Driver) -> bool {
        driver
            .connections
            .get(self.conn_index)
            .is_some_and(|c| c.generation == self.generation)
    }
}

// ── WithDataFuture ───────────────────────────────────────────────────

/// Future returned by [`ConnCtx::with_data`].
pub struct WithDataFuture<F> {
    conn_index: u32,
    parser: Option<F>,
}

impl<F: FnMut(&[u8]) -> ParseResult + Unpin> Future for WithDataFuture<F> {
    type Output = usize;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<usize> {
        with_worker(|driver, executor| {
            let conn_index = self.conn_index;
            // A released slot reads as EOF.
            let eof = driver
                .connections
                .get(conn_index)
                .is_none_or(|c| c.recv_closed);

            // (resolved value, whether bytes leave the accumulator)
            let outcome: Option<(usize, bool)> = {
                let buffered = driver.accumulators.data(conn_index);
                let parser = self.parser.as_mut().expect("polled after completion");
                if buffered.is_empty() {
                    if eof {
                        match parser(&[]) {
                            ParseResult::Consumed(n) => Some((n, false)),
                            ParseResult::NeedMore => Some((0, false)),
                        }
                    } else {
                        None
                    }
                } else {
                    match parser(buffered) {
                        ParseResult::Consumed(n) if n > 0 => Some((n, true)),
                        // A partial unit at EOF can never complete.
                        _ if eof => Some((0, false)),
                        _ => None,
                    }
                }
            };

            match outcome {
                Some((n, consumed)) => {
                    if consumed {
                        driver.accumulators.consume(conn_index, n);
                    }
                    self.parser = None;
                    Poll::Ready(n)
                }
                None => {
                    executor.recv_waiters[conn_index as usize] = Some(current_task());
                    driver.arm(conn_index, crate::poller::READ);
                    Poll::Pending
                }
            }
        })
    }
}

// ── SendFuture ───────────────────────────────────────────────────────

/// Future returned by [`ConnCtx::send`], awaiting outbound-buffer drain.
///
/// The bytes were staged before this future existed; it only watches the
/// buffer empty out, so it carries no data and never allocates.
pub struct SendFuture {
    conn_index: u32,
    generation: u32,
    len: usize,
}

impl Future for SendFuture {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        with_worker(|driver, executor| {
            let Some(conn) = driver
                .connections
                .get_mut(self.conn_index)
                .filter(|c| c.generation == self.generation)
            else {
                return Poll::Ready(Err(closed_error()));
            };
            if let Some(err) = conn.error.take() {
                return Poll::Ready(Err(err));
            }
            if driver.send_buffers.get(self.conn_index).is_empty() {
                return Poll::Ready(Ok(self.len));
            }
            executor.send_waiters[self.conn_index as usize] = Some(current_task());
            Poll::Pending
        })
    }
}

// ── ConnectFuture ────────────────────────────────────────────────────

/// Future returned by [`connect`] and [`ConnCtx::connect`].
///
/// The nonblocking connect is already in flight; this future waits for
/// the socket to turn writable and reads back `SO_ERROR`. Dropping it
/// mid-connect tears the half-open socket down and frees its slot.
pub struct ConnectFuture {
    conn_index: u32,
    generation: u32,
    done: bool,
}

impl Future for ConnectFuture {
    type Output = io::Result<ConnCtx>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<ConnCtx>> {
        with_worker(|driver, executor| {
            let conn_index = self.conn_index;
            let conn = match driver.connections.get_mut(conn_index) {
                Some(c) if c.generation == self.generation => c,
                _ => {
                    self.done = true;
                    return Poll::Ready(Err(closed_error()));
                }
            };
            if let Some(err) = conn.error.take() {
                // The slot was held open so this future could read the
                // real failure; give it back now.
                self.done = true;
                driver.close_connection(executor, conn_index);
                return Poll::Ready(Err(err));
            }
            if conn.phase == crate::connection::ConnPhase::Established {
                self.done = true;
                return Poll::Ready(Ok(ConnCtx::new(conn_index, self.generation)));
            }
            executor.connect_waiters[conn_index as usize] = Some(current_task());
            Poll::Pending
        })
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Abandoned mid-connect (timeout path): reclaim the slot.
        try_with_worker(|driver, executor| {
            if driver
                .connections
                .get(self.conn_index)
                .is_some_and(|c| c.generation == self.generation)
            {
                driver.close_connection(executor, self.conn_index);
            }
        });
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

// ── Sleep ────────────────────────────────────────────────────────────

/// Future that completes after `duration`.
///
/// The deadline enters the worker's timer heap, which in turn bounds the
/// poller timeout, so sleeping costs no thread and no busy loop. The
/// timer fires on the worker that armed it.
///
/// # Panics
///
/// The returned future panics on first poll if the timer table is
/// exhausted, or when polled from a foreign thread. See [`try_sleep`]
/// for the fallible form.
pub fn sleep(duration: Duration) -> SleepFuture {
    SleepFuture {
        delay: duration,
        deadline: None,
        armed: None,
    }
}

/// Future that completes at `deadline`. Panics like [`sleep`].
pub fn sleep_until(deadline: Instant) -> SleepFuture {
    SleepFuture {
        delay: Duration::ZERO,
        deadline: Some(deadline),
        armed: None,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`].
pub struct SleepFuture {
    delay: Duration,
    /// Fixed deadline (`sleep_until`); otherwise `delay` counts from
    /// the first poll.
    deadline: Option<Instant>,
    /// Timer (slot, generation) once armed.
    armed: Option<(u16, u32)>,
}

impl Future for SleepFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        with_worker(|_driver, executor| {
            let owner = current_task();
            match self.armed {
                Some((slot, generation)) => {
                    if executor.timers.is_fired(slot, generation) {
                        executor.timers.release(slot, generation);
                        self.armed = None;
                        return Poll::Ready(());
                    }
                    // The future may have moved to a different task since
                    // the last poll; keep the recorded owner current.
                    executor.timers.update_waker(slot, generation, owner);
                    Poll::Pending
                }
                None => {
                    let when = self
                        .deadline
                        .unwrap_or_else(|| Instant::now() + self.delay);
                    let entry = executor
                        .timers
                        .allocate(when, owner)
                        .expect("timer table exhausted");
                    self.armed = Some(entry);
                    Poll::Pending
                }
            }
        })
    }
}

impl Drop for SleepFuture {
    fn drop(&mut self) {
        if let Some((slot, generation)) = self.armed.take() {
            // The orphaned heap entry is skipped when it surfaces.
            try_with_worker(|_driver, executor| executor.timers.release(slot, generation));
        }
    }
}

/// Fallible [`sleep`]: `Err(TimerExhausted)` when the timer table is
/// full, instead of a panic on first poll. The slot is claimed here, at
/// call time.
///
/// # Panics
///
/// Panics when called from a foreign thread.
pub fn try_sleep(duration: Duration) -> Result<SleepFuture, TimerExhausted> {
    try_sleep_until(Instant::now() + duration)
}

/// Fallible [`sleep_until`]; see [`try_sleep`].
pub fn try_sleep_until(deadline: Instant) -> Result<SleepFuture, TimerExhausted> {
    with_worker(|_driver, executor| {
        let entry = executor
            .timers
            .allocate(deadline, current_task())
            .ok_or_else(|| {
                crate::metrics::TIMERS_EXHAUSTED.increment();
                TimerExhausted
            })?;
        Ok(SleepFuture {
            delay: Duration::ZERO,
            deadline: Some(deadline),
            armed: Some(entry),
        })
    })
}

// ── Timeout ──────────────────────────────────────────────────────────

/// Error returned when a [`timeout`] deadline expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elapsed;

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline has elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Bound `future` by a deadline `duration` from now; `Err(Elapsed)` if
/// it fails to complete in time.
///
/// # Example
///
/// ```no_run
/// # async fn example() {
/// use std::time::Duration;
/// match tideline::timeout(Duration::from_secs(1), async { 42 }).await {
///     Ok(value) => { /* completed in time */ }
///     Err(_elapsed) => { /* timed out */ }
/// }
/// # }
/// ```
pub fn timeout<F: Future>(duration: Duration, future: F) -> TimeoutFuture<F> {
    TimeoutFuture {
        future,
        sleep: sleep(duration),
    }
}

/// Fallible [`timeout`]: `Err(TimerExhausted)` when the timer table is
/// full, instead of a panic on first poll.
///
/// # Panics
///
/// Panics when called from a foreign thread.
pub fn try_timeout<F: Future>(
    duration: Duration,
    future: F,
) -> Result<TimeoutFuture<F>, TimerExhausted> {
    let sleep = try_sleep(duration)?;
    Ok(TimeoutFuture { future, sleep })
}

/// Bound `future` by the absolute deadline `deadline`; `Err(Elapsed)` if
/// it fails to complete in time. Panics like [`timeout`] when the timer
/// table is exhausted.
pub fn timeout_at<F: Future>(deadline: Instant, future: F) -> TimeoutFuture<F> {
    TimeoutFuture {
        future,
        sleep: sleep_until(deadline),
    }
}

/// Fallible [`timeout_at`]; see [`try_timeout`].
pub fn try_timeout_at<F: Future>(
    deadline: Instant,
    future: F,
) -> Result<TimeoutFuture<F>, TimerExhausted> {
    let sleep = try_sleep_until(deadline)?;
    Ok(TimeoutFuture { future, sleep })
}

pin_project_lite::pin_project! {
    /// Future returned by [`timeout()`] or [`timeout_at()`].
    pub struct TimeoutFuture<F> {
        #[pin]
        future: F,
        #[pin]
        sleep: SleepFuture,
    }
}

impl<F: Future> Future for TimeoutFuture<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // The wrapped future gets the first look; the deadline only
        // matters while it is still pending.
        match this.future.poll(cx) {
            Poll::Ready(output) => Poll::Ready(Ok(output)),
            Poll::Pending => match this.sleep.poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(Elapsed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
