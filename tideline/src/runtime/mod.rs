//! Async runtime for tideline: task executor, waker, and I/O primitives.
//!
//! # Layering
//!
//! The async machinery is independent of the readiness backend:
//!
//! - `task` — `TaskTable`: both task lanes behind one encoded ID space
//! - `waker` — `task_waker()`, thread-local `READY_QUEUE`
//! - `timer` — deadline heap feeding the poll timeout
//! - `mod.rs` — `Executor` (waiter records, ready queue)
//! - `handler` — `ConnectionHandler` trait
//!
//! Only `io` (the `ConnCtx` futures) touches the concrete `Driver` type,
//! through a thread-local pointer that is valid while a task is polled.

pub(crate) mod handler;
pub(crate) mod io;
pub(crate) mod task;
pub(crate) mod timer;
pub(crate) mod waker;

use std::cell::Cell;
use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, unbounded};

use self::task::TaskTable;
use self::timer::TimerTable;
use self::waker::drain_ready_queue;

thread_local! {
    /// The encoded ID of the task being polled, set by the executor
    /// before each poll. Waiter registration records this ID so the
    /// driver knows whom to wake.
    pub(crate) static CURRENT_TASK_ID: Cell<u32> = const { Cell::new(0) };
}

/// Per-worker async executor. Owns the task table and coordinates
/// readiness-driven wakeups with future polling.
///
/// Waiter records store the waiting task's ID rather than a flag: the
/// task parked on a connection is not necessarily the connection's own
/// task (outbound connects, or a protocol crate splitting one connection
/// between a reader task and a writer task). At most one task may wait
/// per (connection, direction) at a time; `Option::take` makes each wake
/// exactly-once.
pub(crate) struct Executor {
    pub(crate) tasks: TaskTable,
    /// Pending timers for sleep/timeout.
    pub(crate) timers: TimerTable,
    /// Encoded task IDs ready to poll.
    pub(crate) ready_queue: VecDeque<u32>,
    /// Per-connection: task awaiting recv data.
    pub(crate) recv_waiters: Vec<Option<u32>>,
    /// Per-connection: task awaiting outbound-buffer drain.
    pub(crate) send_waiters: Vec<Option<u32>>,
    /// Per-connection: task awaiting connect establishment.
    pub(crate) connect_waiters: Vec<Option<u32>>,
    /// Cross-thread wake channel: [`remote_waker()`](crate::remote_waker)
    /// handles push task IDs here from other threads; drained alongside
    /// the thread-local queue.
    pub(crate) remote_tx: Sender<u32>,
    remote_rx: Receiver<u32>,
}

impl Executor {
    /// Create a new executor with the given capacities.
    pub(crate) fn new(max_connections: u32, standalone_capacity: u32, timer_slots: u32) -> Self {
        let cap = max_connections as usize;
        let (remote_tx, remote_rx) = unbounded();
        Executor {
            tasks: TaskTable::new(max_connections, standalone_capacity),
            timers: TimerTable::new(timer_slots),
            ready_queue: VecDeque::with_capacity(64),
            recv_waiters: vec![None; cap],
            send_waiters: vec![None; cap],
            connect_waiters: vec![None; cap],
            remote_tx,
            remote_rx,
        }
    }

    /// Drain the thread-local waker queue and the cross-thread wake
    /// channel into our ready_queue.
    pub(crate) fn collect_wakeups(&mut self) {
        drain_ready_queue(&mut self.ready_queue);
        while let Ok(task_id) = self.remote_rx.try_recv() {
            self.ready_queue.push_back(task_id);
        }
    }

    /// Reset all per-connection state for a connection that was closed.
    pub(crate) fn remove_connection(&mut self, conn_index: u32) {
        let idx = conn_index as usize;
        self.tasks.remove(conn_index);
        if idx < self.recv_waiters.len() {
            self.recv_waiters[idx] = None;
            self.send_waiters[idx] = None;
            self.connect_waiters[idx] = None;
        }
    }

    /// Wake a task by its encoded ID.
    ///
    /// Returns true if the task was parked and is now ready.
    pub(crate) fn wake_task(&mut self, task_id: u32) -> bool {
        if self.tasks.wake(task_id) {
            self.ready_queue.push_back(task_id);
            return true;
        }
        false
    }

    /// Wake the task waiting for recv data on a connection, if any.
    pub(crate) fn wake_recv(&mut self, conn_index: u32) {
        let idx = conn_index as usize;
        if idx < self.recv_waiters.len()
            && let Some(task_id) = self.recv_waiters[idx].take()
        {
            self.wake_task(task_id);
        }
    }

    /// Wake the task waiting for the outbound buffer to drain, if any.
    pub(crate) fn wake_send(&mut self, conn_index: u32) {
        let idx = conn_index as usize;
        if idx < self.send_waiters.len()
            && let Some(task_id) = self.send_waiters[idx].take()
        {
            self.wake_task(task_id);
        }
    }

    /// Wake the task waiting for connect establishment, if any.
    pub(crate) fn wake_connect(&mut self, conn_index: u32) {
        let idx = conn_index as usize;
        if idx < self.connect_waiters.len()
            && let Some(task_id) = self.connect_waiters[idx].take()
        {
            self.wake_task(task_id);
        }
    }

    /// Fire every timer due at `now`, waking the owning tasks.
    pub(crate) fn fire_timers(&mut self, now: std::time::Instant) {
        // Collect first: waking mutates the table and ready queue.
        let mut due: Vec<u32> = Vec::new();
        self.timers.fire_due(now, |task_id| due.push(task_id));
        for task_id in due {
            self.wake_task(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawn-take-park a connection task so it sits parked, awaiting a wake.
    fn park_conn_task(exec: &mut Executor, conn_index: u32) {
        exec.tasks
            .spawn_conn(conn_index, Box::pin(std::future::pending::<()>()));
        let fut = exec.tasks.take_ready(conn_index).unwrap();
        exec.tasks.park(conn_index, fut);
    }

    /// Same, for a standalone task. Returns its encoded ID.
    fn park_standalone_task(exec: &mut Executor) -> u32 {
        let id = exec
            .tasks
            .spawn_standalone(Box::pin(std::future::pending::<()>()))
            .unwrap();
        let fut = exec.tasks.take_ready(id).unwrap();
        exec.tasks.park(id, fut);
        id
    }

    #[test]
    fn executor_new() {
        let exec = Executor::new(16, 8, 8);
        assert!(exec.ready_queue.is_empty());
        assert_eq!(exec.recv_waiters.len(), 16);
        assert_eq!(exec.send_waiters.len(), 16);
        assert_eq!(exec.connect_waiters.len(), 16);
    }

    #[test]
    fn remove_connection_clears_state() {
        let mut exec = Executor::new(4, 4, 4);
        exec.recv_waiters[1] = Some(1);
        exec.send_waiters[1] = Some(2);
        exec.connect_waiters[1] = Some(3);

        exec.remove_connection(1);
        assert!(exec.recv_waiters[1].is_none());
        assert!(exec.send_waiters[1].is_none());
        assert!(exec.connect_waiters[1].is_none());
    }

    #[test]
    fn wake_task_queues_parked_tasks_of_either_kind() {
        let mut exec = Executor::new(4, 4, 4);
        park_conn_task(&mut exec, 1);
        let standalone_id = park_standalone_task(&mut exec);

        assert!(exec.wake_task(1));
        assert!(exec.wake_task(standalone_id));
        assert_eq!(exec.ready_queue, [1, standalone_id]);

        // A second wake of an already-queued task is a no-op.
        assert!(!exec.wake_task(1));
        assert_eq!(exec.ready_queue.len(), 2);
    }

    #[test]
    fn waiter_routes_to_recorded_task() {
        let mut exec = Executor::new(16, 4, 4);

        // Task at index 5 waits on connection 12 (outbound connect scenario).
        park_conn_task(&mut exec, 5);
        exec.recv_waiters[12] = Some(5);
        exec.wake_recv(12);

        // The task at index 5 should be woken, not index 12.
        assert_eq!(exec.ready_queue, [5]);
        assert!(exec.recv_waiters[12].is_none());
    }

    #[test]
    fn reader_and_writer_wait_on_same_connection() {
        let mut exec = Executor::new(16, 4, 4);

        // Connection 2's own task parked on recv; a standalone writer
        // task parked on send of the same connection.
        park_conn_task(&mut exec, 2);
        let writer_id = park_standalone_task(&mut exec);

        exec.recv_waiters[2] = Some(2);
        exec.send_waiters[2] = Some(writer_id);

        exec.wake_send(2);
        assert_eq!(exec.ready_queue, [writer_id]);
        // Recv waiter untouched by the send wake.
        assert_eq!(exec.recv_waiters[2], Some(2));

        exec.wake_recv(2);
        assert_eq!(exec.ready_queue, [writer_id, 2]);
    }

    #[test]
    fn wake_without_waiter_is_noop() {
        let mut exec = Executor::new(4, 4, 4);
        exec.wake_recv(0);
        exec.wake_send(0);
        exec.wake_connect(0);
        assert!(exec.ready_queue.is_empty());
    }

    #[test]
    fn remote_channel_feeds_ready_queue() {
        waker::READY_QUEUE.with(|q| q.borrow_mut().clear());
        let mut exec = Executor::new(4, 4, 4);
        let tx = exec.remote_tx.clone();

        let handle = std::thread::spawn(move || {
            tx.send(3).unwrap();
        });
        handle.join().unwrap();

        exec.collect_wakeups();
        assert_eq!(exec.ready_queue, [3]);
    }

    #[test]
    fn fire_timers_wakes_owner() {
        let mut exec = Executor::new(4, 4, 4);
        park_conn_task(&mut exec, 1);

        let now = std::time::Instant::now();
        let (slot, generation) = exec.timers.allocate(now, 1).unwrap();
        exec.fire_timers(now);

        assert!(exec.timers.is_fired(slot, generation));
        assert_eq!(exec.ready_queue, [1]);
    }
}
