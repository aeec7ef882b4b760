use std::task::Context;
use std::time::Instant;

use crate::driver::Driver;
use crate::poller::{EventBatch, LISTEN_TOKEN};
use crate::runtime::handler::ConnectionHandler;
use crate::runtime::io::{ConnCtx, PollScope, enter_poll_scope, exit_poll_scope};
use crate::runtime::task::STANDALONE_BIT;
use crate::runtime::waker::task_waker;
use crate::runtime::{CURRENT_TASK_ID, Executor};
use crate::connection::ConnPhase;

const READABLE: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const WRITABLE: u32 = libc::EPOLLOUT as u32;
const CONNECT_DONE: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Per-worker event loop: drives the poller and polls connection futures.
pub(crate) struct EventLoop<H: ConnectionHandler> {
    driver: Driver,
    handler: H,
    executor: Executor,
    poll_timeout_ms: i32,
    events: EventBatch,
    accepted: Vec<u32>,
}

impl<H: ConnectionHandler> EventLoop<H> {
    pub(crate) fn new(config: &crate::config::Config, handler: H, driver: Driver) -> Self {
        let executor = Executor::new(
            config.max_connections,
            config.standalone_task_capacity,
            config.timer_slots,
        );
        // Sub-millisecond timeouts round up so a zero-timeout spin only
        // happens when tasks are actually ready.
        let poll_timeout_ms = config.poll_timeout_us.div_ceil(1000).max(1) as i32;
        EventLoop {
            driver,
            handler,
            executor,
            poll_timeout_ms,
            events: EventBatch::new(),
            accepted: Vec::new(),
        }
    }

    /// Run the event loop. Blocks the current thread until shutdown.
    pub(crate) fn run(&mut self) -> Result<(), crate::error::Error> {
        if let Some(listen_fd) = self.driver.listen_fd {
            self.driver
                .poller
                .add_listener(listen_fd)
                .map_err(crate::error::Error::Io)?;
        }

        // Spawn on_start task (client-only entry point).
        if let Some(future) = self.handler.on_start()
            && let Some(task_id) = self.executor.tasks.spawn_standalone(future)
        {
            self.executor.ready_queue.push_back(task_id);
        }

        loop {
            // Snapshot the wake epoch before draining registrations: a
            // wake landing after the snapshot stays unobserved and forces
            // the next poll to return immediately, so no arm can be lost.
            let epoch = self.driver.poller.wake_state().epoch_snapshot();
            self.driver.apply_registrations();
            self.driver.poller.wake_state().mark_observed(epoch);

            let timeout_ms = self.compute_poll_timeout();
            let mut events = std::mem::take(&mut self.events);
            events.clear();
            let poll_result = self.driver.poller.poll(timeout_ms, &mut events);
            self.dispatch_events(&events);
            self.events = events;
            poll_result?;

            if self.driver.shutdown_requested() {
                self.driver.run_shutdown(&mut self.executor);
                return Ok(());
            }

            self.executor.fire_timers(Instant::now());
            self.executor.collect_wakeups();
            self.poll_ready_tasks();
        }
    }

    /// Poll timeout for this iteration: zero when tasks are already
    /// ready, otherwise bounded by the nearest timer deadline.
    fn compute_poll_timeout(&mut self) -> i32 {
        if !self.executor.ready_queue.is_empty() {
            return 0;
        }
        let mut timeout_ms = self.poll_timeout_ms;
        if let Some(deadline) = self.executor.timers.next_deadline() {
            let until = deadline
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(i32::MAX as u128) as i32;
            timeout_ms = timeout_ms.min(until);
        }
        timeout_ms
    }

    fn dispatch_events(&mut self, events: &EventBatch) {
        for &(token, bits) in events {
            if token == LISTEN_TOKEN {
                self.driver.accept_ready(&mut self.accepted);
                let accepted = std::mem::take(&mut self.accepted);
                for slot in &accepted {
                    self.spawn_accept_task(*slot);
                }
                self.accepted = accepted;
                self.accepted.clear();
                continue;
            }

            let slot = token as u32;
            let Some(cs) = self.driver.connections.get(slot) else {
                continue; // closed between poll and dispatch
            };
            if cs.phase == ConnPhase::Connecting {
                if bits & CONNECT_DONE != 0 {
                    self.driver.handle_connect_ready(&mut self.executor, slot);
                }
                continue;
            }
            if bits & READABLE != 0 {
                self.driver.handle_readable(&mut self.executor, slot);
            }
            if bits & WRITABLE != 0 {
                self.driver.handle_writable(&mut self.executor, slot);
            }
        }
    }

    /// Poll all tasks in the ready queue.
    fn poll_ready_tasks(&mut self) {
        // One poll scope covers the whole batch.
        let mut scope = PollScope {
            driver: &mut self.driver as *mut Driver,
            executor: &mut self.executor as *mut Executor,
        };
        enter_poll_scope(&mut scope);

        let mut i = 0;
        while i < self.executor.ready_queue.len() {
            let task_id = self.executor.ready_queue[i];
            i += 1;

            // Vacant or parked slots skip stale queue entries.
            let Some(mut fut) = self.executor.tasks.take_ready(task_id) else {
                continue;
            };
            let waker = task_waker(task_id);
            let mut cx = Context::from_waker(&waker);

            CURRENT_TASK_ID.with(|c| c.set(task_id));
            match fut.as_mut().poll(&mut cx) {
                std::task::Poll::Ready(()) => {
                    if task_id & STANDALONE_BIT != 0 {
                        self.executor.tasks.remove(task_id);
                    } else {
                        // Handler finished — the connection closes with it.
                        self.driver.close_connection(&mut self.executor, task_id);
                        self.executor.remove_connection(task_id);
                    }
                }
                std::task::Poll::Pending => {
                    self.executor.tasks.park(task_id, fut);
                }
            }
        }

        exit_poll_scope();

        self.executor.ready_queue.clear();

        // Pick up wakeups that fired during polling.
        self.executor.collect_wakeups();
    }

    /// Spawn an async task for a newly accepted connection.
    fn spawn_accept_task(&mut self, conn_index: u32) {
        let generation = self.driver.connections.generation(conn_index);
        let conn_ctx = ConnCtx::new(conn_index, generation);
        let future = Box::pin(self.handler.on_accept(conn_ctx));
        self.executor.tasks.spawn_conn(conn_index, future);
        self.executor.ready_queue.push_back(conn_index);
    }
}
