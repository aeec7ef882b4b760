//! HTTP/1.1 server connection pipeline.
//!
//! Each connection runs two cooperating tasks on its worker's executor:
//! the reader loop (the connection task itself) parses heads, frames
//! bodies, and spawns one standalone handler task per request; a
//! standalone writer task drains a FIFO of response slots so pipelined
//! responses always leave in request order, no matter which handler
//! finishes first.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

use tideline::{ConnCtx, ConnectionHandler, ParseResult, ShutdownHandle, TidelineBuilder};

use crate::body::{BodyCompletion, BodyOutcome, BodyProgress, BodyReader, BodyShared};
use crate::parse::parse_request_head;
use crate::request::{Request, RequestHead, Version};
use crate::response::{Response, serialize_response};

/// Per-connection pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Reject request heads larger than this many bytes with a `400`.
    pub max_head_bytes: usize,
    /// Maximum responses in flight per connection. At the bound the
    /// reader stops parsing until the writer drains a slot.
    pub max_pipelined: usize,
    /// Answer `Expect: 100-continue` with an interim `100` before the
    /// handler runs.
    pub continue_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_head_bytes: 16 * 1024,
            max_pipelined: 32,
            continue_enabled: true,
        }
    }
}

/// Error a handler returns when it cannot produce a response. The
/// pipeline turns it into a `500` (if the response slot has not been
/// written) and closes the connection.
#[derive(Debug)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

/// An HTTP request handler, one instance per worker.
///
/// `call` receives each parsed request with a streaming body and returns
/// the response. The returned future must be `'static`: clone what it
/// needs out of `&self` (the service itself sits behind an `Arc` and
/// is shared by every connection on the worker).
pub trait HttpService: Send + Sync + 'static {
    /// Create the per-worker service instance.
    fn create_for_worker(worker_id: usize) -> Self
    where
        Self: Sized;

    /// Pipeline tuning for connections served by this service.
    fn config(&self) -> ServerConfig {
        ServerConfig::default()
    }

    /// Handle one request.
    fn call(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, HandlerError>> + 'static;
}

/// Builder that launches an [`HttpService`] on tideline workers.
pub struct HttpServerBuilder {
    config: tideline::Config,
    bind_addr: Option<SocketAddr>,
}

impl HttpServerBuilder {
    pub fn new(config: tideline::Config) -> Self {
        HttpServerBuilder {
            config,
            bind_addr: None,
        }
    }

    /// Address the per-worker `SO_REUSEPORT` listeners bind to.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Launch worker threads serving `S`.
    #[allow(clippy::type_complexity)]
    pub fn launch<S: HttpService>(
        self,
    ) -> Result<
        (
            ShutdownHandle,
            Vec<thread::JoinHandle<Result<(), tideline::Error>>>,
        ),
        tideline::Error,
    > {
        let mut builder = TidelineBuilder::new(self.config);
        if let Some(addr) = self.bind_addr {
            builder = builder.bind(addr);
        }
        builder.launch::<H1Server<S>>()
    }
}

/// Adapter mounting an [`HttpService`] onto [`tideline::ConnectionHandler`].
pub struct H1Server<S> {
    service: Arc<S>,
    config: ServerConfig,
}

impl<S: HttpService> ConnectionHandler for H1Server<S> {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        let service = Arc::clone(&self.service);
        let config = self.config;
        async move {
            serve_connection(conn, service, config).await;
        }
    }

    fn create_for_worker(worker_id: usize) -> Self {
        let service = S::create_for_worker(worker_id);
        let config = service.config();
        H1Server {
            service: Arc::new(service),
            config,
        }
    }
}

// ── Response slot queue ──────────────────────────────────────────────

#[derive(Clone, Copy)]
struct SlotMeta {
    head_request: bool,
    keep_alive: bool,
    version: Version,
    /// Interim responses (the `100 Continue`) do not terminate the
    /// request/response exchange and never close the connection.
    interim: bool,
}

struct ResponseSlot {
    meta: SlotMeta,
    /// `None` while the handler is still running.
    result: RefCell<Option<Result<Response, HandlerError>>>,
}

/// State shared by the reader loop, the writer task, and handler tasks
/// of one connection. Single-threaded by construction (all three run on
/// the connection's worker).
struct PipelineState {
    slots: RefCell<VecDeque<Rc<ResponseSlot>>>,
    writer_waker: RefCell<Option<Waker>>,
    reader_waker: RefCell<Option<Waker>>,
    exit_waker: RefCell<Option<Waker>>,
    /// Reader will push no further slots.
    reader_done: Cell<bool>,
    /// The connection is closing; the reader must stop parsing.
    closing: Cell<bool>,
    writer_finished: Cell<bool>,
}

impl PipelineState {
    fn new() -> Rc<Self> {
        Rc::new(PipelineState {
            slots: RefCell::new(VecDeque::new()),
            writer_waker: RefCell::new(None),
            reader_waker: RefCell::new(None),
            exit_waker: RefCell::new(None),
            reader_done: Cell::new(false),
            closing: Cell::new(false),
            writer_finished: Cell::new(false),
        })
    }

    fn push_slot(&self, meta: SlotMeta, result: Option<Result<Response, HandlerError>>) -> Rc<ResponseSlot> {
        let slot = Rc::new(ResponseSlot {
            meta,
            result: RefCell::new(result),
        });
        self.slots.borrow_mut().push_back(Rc::clone(&slot));
        self.wake_writer();
        slot
    }

    fn fill_slot(&self, slot: &ResponseSlot, result: Result<Response, HandlerError>) {
        *slot.result.borrow_mut() = Some(result);
        self.wake_writer();
    }

    fn begin_close(&self) {
        self.closing.set(true);
        self.wake_reader();
    }

    fn wake_writer(&self) {
        if let Some(w) = self.writer_waker.borrow_mut().take() {
            w.wake();
        }
    }

    fn wake_reader(&self) {
        if let Some(w) = self.reader_waker.borrow_mut().take() {
            w.wake();
        }
    }

    fn wake_exit(&self) {
        if let Some(w) = self.exit_waker.borrow_mut().take() {
            w.wake();
        }
    }
}

/// Resolves with the front slot's response once the handler has filled
/// it, strictly FIFO. Resolves with `None` when the reader is done and
/// every slot has been written.
struct NextResponse {
    state: Rc<PipelineState>,
}

impl Future for NextResponse {
    type Output = Option<(SlotMeta, Result<Response, HandlerError>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let front = self.state.slots.borrow().front().cloned();
        match front {
            None => {
                if self.state.reader_done.get() {
                    return Poll::Ready(None);
                }
            }
            Some(slot) => {
                if let Some(result) = slot.result.borrow_mut().take() {
                    self.state.slots.borrow_mut().pop_front();
                    // Pipeline depth decreased.
                    self.state.wake_reader();
                    return Poll::Ready(Some((slot.meta, result)));
                }
            }
        }
        *self.state.writer_waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Resolves when the slot queue has room for another request (or the
/// connection started closing).
struct QueueSpace {
    state: Rc<PipelineState>,
    max_pipelined: usize,
}

impl Future for QueueSpace {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.closing.get() || self.state.slots.borrow().len() < self.max_pipelined {
            return Poll::Ready(());
        }
        *self.state.reader_waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Resolves once the writer task has exited; the connection task must
/// not return (closing the connection) while responses are in flight.
struct WriterExit {
    state: Rc<PipelineState>,
}

impl Future for WriterExit {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.state.writer_finished.get() {
            return Poll::Ready(());
        }
        *self.state.exit_waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

// ── Reader loop ──────────────────────────────────────────────────────

async fn serve_connection<S: HttpService>(conn: ConnCtx, service: Arc<S>, config: ServerConfig) {
    let state = PipelineState::new();

    eprintln!("DBG serve_connection start");
    let writer_state = Rc::clone(&state);
    if tideline::spawn(writer_loop(conn, writer_state)).is_err() {
        // Standalone slab exhausted; nothing useful can run.
        conn.close();
        return;
    }

    reader_loop(conn, &service, config, &state).await;

    state.reader_done.set(true);
    state.wake_writer();
    WriterExit {
        state: Rc::clone(&state),
    }
    .await;
}

enum HeadOutcome {
    Parsed(Box<RequestHead>, BodyProgressKind),
    Rejected,
}

/// Framing decision carried out of the parse closure.
enum BodyProgressKind {
    Kind(crate::body::BodyKind),
    Invalid,
}

async fn reader_loop<S: HttpService>(
    conn: ConnCtx,
    service: &Arc<S>,
    config: ServerConfig,
    state: &Rc<PipelineState>,
) {
    loop {
        if state.closing.get() {
            return;
        }

        QueueSpace {
            state: Rc::clone(state),
            max_pipelined: config.max_pipelined,
        }
        .await;
        if state.closing.get() {
            return;
        }

        // Parse the next request head out of the accumulator.
        let mut outcome: Option<HeadOutcome> = None;
        let n = conn
            .with_data(|data| match parse_request_head(data, config.max_head_bytes) {
                Ok(Some((head, consumed))) => {
                    let kind = match crate::body::request_body_kind(&head) {
                        Ok(kind) => BodyProgressKind::Kind(kind),
                        Err(_) => BodyProgressKind::Invalid,
                    };
                    outcome = Some(HeadOutcome::Parsed(Box::new(head), kind));
                    ParseResult::Consumed(consumed)
                }
                Ok(None) => ParseResult::NeedMore,
                Err(_) => {
                    // Consume the malformed bytes so the future resolves;
                    // the connection is closing behind the 400 anyway.
                    outcome = Some(HeadOutcome::Rejected);
                    ParseResult::Consumed(data.len())
                }
            })
            .await;

        eprintln!("DBG reader with_data returned n={n} outcome_some={}", outcome.is_some());
        let (head, kind) = match outcome {
            // EOF between requests (or mid-head): the peer is gone.
            None => return,
            Some(HeadOutcome::Rejected)
            | Some(HeadOutcome::Parsed(_, BodyProgressKind::Invalid)) => {
                enqueue_rejection(state);
                return;
            }
            Some(HeadOutcome::Parsed(head, BodyProgressKind::Kind(kind))) => {
                debug_assert!(n > 0);
                (head, kind)
            }
        };

        let head_request = head.method.eq_ignore_ascii_case("HEAD");
        // An upgrade request is the last one parsed on this connection.
        let keep_alive = head.is_keep_alive() && !head.wants_upgrade();
        let version = head.version;

        if config.continue_enabled && head.expects_continue() {
            state.push_slot(
                SlotMeta {
                    head_request: false,
                    keep_alive: true,
                    version,
                    interim: true,
                },
                Some(Ok(Response::new(100))),
            );
        }

        let body_shared = BodyShared::new();
        let body = BodyReader::new(conn, kind, Rc::clone(&body_shared));
        let request = Request { head: *head, body };

        let slot = state.push_slot(
            SlotMeta {
                head_request,
                keep_alive,
                version,
                interim: false,
            },
            None,
        );

        let task_service = Arc::clone(service);
        let task_state = Rc::clone(state);
        let task_slot = Rc::clone(&slot);
        let spawned = tideline::spawn(async move {
            eprintln!("DBG handler task start");
            let result = task_service.call(request).await;
            eprintln!("DBG handler task done ok={}", result.is_ok());
            task_state.fill_slot(&task_slot, result);
        });
        if spawned.is_err() {
            state.fill_slot(&slot, Err(HandlerError::new("task capacity exhausted")));
        }

        // The next head cannot be parsed until this request's body bytes
        // have left the accumulator.
        let outcome = BodyCompletion {
            shared: body_shared,
        }
        .await;
        eprintln!("DBG body completion resolved");
        match outcome {
            BodyOutcome::Completed { force_close: false } => {}
            BodyOutcome::Completed { force_close: true } => return,
            BodyOutcome::Abandoned(progress) => match progress {
                None => {}
                Some(BodyProgress::UntilClose) => {
                    state.begin_close();
                    return;
                }
                Some(progress) => {
                    // Drain the unread remainder so the connection can be
                    // reused for the next pipelined request.
                    if BodyReader::resume(conn, progress).bytes().await.is_err() {
                        return;
                    }
                }
            },
        }

        if !keep_alive {
            return;
        }
    }
}

/// Enqueue the prebuilt `400` for a malformed request; the connection
/// closes after it is written.
fn enqueue_rejection(state: &Rc<PipelineState>) {
    state.push_slot(
        SlotMeta {
            head_request: false,
            keep_alive: false,
            version: Version::Http11,
            interim: false,
        },
        Some(Ok(Response::new(400))),
    );
}

// ── Writer task ──────────────────────────────────────────────────────

async fn writer_loop(conn: ConnCtx, state: Rc<PipelineState>) {
    eprintln!("DBG writer_loop start");
    loop {
        let next = NextResponse {
            state: Rc::clone(&state),
        }
        .await;
        eprintln!("DBG writer got next: {}", next.is_some());
        let Some((meta, result)) = next else {
            break;
        };

        let (mut response, failed) = match result {
            Ok(response) => (response, false),
            // Handler failure: the response was never started, so a 500
            // can still be written; the connection closes after it.
            Err(_) => (Response::new(500), true),
        };

        let upgrade = response.take_upgrade();
        let is_upgrade = upgrade.is_some() && response.status() == 101;
        let close_after = !meta.interim
            && (failed
                || (!meta.keep_alive && !is_upgrade)
                || response.headers().has_token("connection", "close"));

        if !meta.interim && !is_upgrade && !response.headers().contains("connection") {
            if close_after {
                response.add_header("connection", "close");
            } else if meta.version == Version::Http10 {
                response.add_header("connection", "keep-alive");
            }
        }

        let mut wire = Vec::new();
        serialize_response(&mut wire, &response, meta.head_request);

        eprintln!("DBG writer sending {} bytes", wire.len());
        let sent = match conn.send(&wire) {
            Ok(fut) => fut.await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            state.begin_close();
            break;
        }

        if meta.interim {
            continue;
        }

        if is_upgrade {
            state.begin_close();
            if let Some(factory) = upgrade {
                // HTTP framing ends here; any bytes the client sent past
                // the request head are still in the accumulator.
                factory(conn).await;
            }
            conn.close();
            break;
        }

        if close_after {
            state.begin_close();
            conn.close();
            break;
        }
    }

    state.writer_finished.set(true);
    state.wake_exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Waker, Arc<CountingWake>) {
        let inner = Arc::new(CountingWake(AtomicUsize::new(0)));
        (Waker::from(Arc::clone(&inner)), inner)
    }

    fn meta(keep_alive: bool) -> SlotMeta {
        SlotMeta {
            head_request: false,
            keep_alive,
            version: Version::Http11,
            interim: false,
        }
    }

    fn poll_next(
        state: &Rc<PipelineState>,
        waker: &Waker,
    ) -> Poll<Option<(SlotMeta, Result<Response, HandlerError>)>> {
        let mut cx = Context::from_waker(waker);
        let mut fut = NextResponse {
            state: Rc::clone(state),
        };
        Pin::new(&mut fut).poll(&mut cx)
    }

    #[test]
    fn responses_pop_in_fifo_order() {
        let state = PipelineState::new();
        let (waker, _) = counting_waker();

        let first = state.push_slot(meta(true), None);
        state.push_slot(meta(true), Some(Ok(Response::new(201))));

        // Front slot unfilled: the filled second slot must not jump the
        // queue.
        assert!(poll_next(&state, &waker).is_pending());

        state.fill_slot(&first, Ok(Response::new(200)));
        match poll_next(&state, &waker) {
            Poll::Ready(Some((_, Ok(resp)))) => assert_eq!(resp.status(), 200),
            _ => panic!("expected first response"),
        }
        match poll_next(&state, &waker) {
            Poll::Ready(Some((_, Ok(resp)))) => assert_eq!(resp.status(), 201),
            _ => panic!("expected second response"),
        }
    }

    #[test]
    fn empty_queue_finishes_only_after_reader_done() {
        let state = PipelineState::new();
        let (waker, _) = counting_waker();

        assert!(poll_next(&state, &waker).is_pending());
        state.reader_done.set(true);
        assert!(matches!(poll_next(&state, &waker), Poll::Ready(None)));
    }

    #[test]
    fn fill_wakes_parked_writer() {
        let state = PipelineState::new();
        let (waker, count) = counting_waker();

        let slot = state.push_slot(meta(true), None);
        assert!(poll_next(&state, &waker).is_pending());
        assert_eq!(count.0.load(Ordering::SeqCst), 0);

        state.fill_slot(&slot, Ok(Response::new(200)));
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_space_respects_pipeline_bound() {
        let state = PipelineState::new();
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        state.push_slot(meta(true), None);
        state.push_slot(meta(true), None);

        let mut fut = QueueSpace {
            state: Rc::clone(&state),
            max_pipelined: 2,
        };
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        // Draining one slot wakes the reader and opens a slot.
        let front = state.slots.borrow().front().cloned().unwrap();
        state.fill_slot(&front, Ok(Response::new(200)));
        let (writer_waker, _) = counting_waker();
        assert!(poll_next(&state, &writer_waker).is_ready());
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }

    #[test]
    fn closing_unblocks_queue_space() {
        let state = PipelineState::new();
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        state.push_slot(meta(true), None);
        let mut fut = QueueSpace {
            state: Rc::clone(&state),
            max_pipelined: 1,
        };
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        state.begin_close();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }
}
