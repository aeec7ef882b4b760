//! Task storage for the per-worker executor.
//!
//! All tasks on a worker share one ID space. A connection task's ID is
//! its connection index (bits 0..24), pinned for the connection's
//! lifetime so readiness events address it directly. Standalone tasks
//! live in a free-listed lane and their IDs carry [`STANDALONE_BIT`].
//! Wakers, waiter records, and the ready queue all traffic in these
//! encoded IDs; only this module knows which lane an ID names.

use std::future::Future;
use std::pin::Pin;

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Set on the IDs of standalone tasks; the remaining bits index the
/// standalone lane. Connection indices never reach bit 24, so the two
/// ranges cannot collide.
pub(crate) const STANDALONE_BIT: u32 = 1 << 31;

/// Opaque handle for a standalone task spawned via [`spawn()`](crate::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) u32);

enum Slot {
    Vacant,
    /// Returned `Poll::Pending`; a wake moves it to `Ready`.
    Parked(TaskFuture),
    /// Queued (or about to be queued) for polling.
    Ready(TaskFuture),
}

impl Slot {
    fn take_ready(&mut self) -> Option<TaskFuture> {
        match std::mem::replace(self, Slot::Vacant) {
            Slot::Ready(future) => Some(future),
            other => {
                *self = other;
                None
            }
        }
    }

    /// `Parked` becomes `Ready`. Returns whether the caller should queue
    /// the task — false when it is already queued or the slot is vacant.
    fn wake(&mut self) -> bool {
        match std::mem::replace(self, Slot::Vacant) {
            Slot::Parked(future) => {
                *self = Slot::Ready(future);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }
}

/// Both lanes of a worker's tasks behind the encoded ID space.
pub(crate) struct TaskTable {
    conn_lane: Vec<Slot>,
    standalone_lane: Vec<Slot>,
    free: Vec<u32>,
}

impl TaskTable {
    pub(crate) fn new(max_connections: u32, standalone_capacity: u32) -> Self {
        let mut conn_lane = Vec::with_capacity(max_connections as usize);
        conn_lane.resize_with(max_connections as usize, || Slot::Vacant);
        let mut standalone_lane = Vec::with_capacity(standalone_capacity as usize);
        standalone_lane.resize_with(standalone_capacity as usize, || Slot::Vacant);
        // Popping from the back hands out low indices first.
        let free = (0..standalone_capacity).rev().collect();
        TaskTable {
            conn_lane,
            standalone_lane,
            free,
        }
    }

    /// Install the long-lived task for a connection, ready for its first
    /// poll. The slot must be vacant: connection close removes the task
    /// before the index can be reused.
    pub(crate) fn spawn_conn(&mut self, conn_index: u32, future: TaskFuture) {
        let idx = conn_index as usize;
        debug_assert!(idx < self.conn_lane.len(), "conn_index out of range");
        debug_assert!(
            matches!(self.conn_lane[idx], Slot::Vacant),
            "connection {conn_index} already has a task"
        );
        self.conn_lane[idx] = Slot::Ready(future);
    }

    /// Allocate a standalone task, ready for its first poll. Returns the
    /// encoded ID, or `None` when the lane is full.
    pub(crate) fn spawn_standalone(&mut self, future: TaskFuture) -> Option<u32> {
        let idx = self.free.pop()?;
        self.standalone_lane[idx as usize] = Slot::Ready(future);
        Some(idx | STANDALONE_BIT)
    }

    fn slot_mut(&mut self, task_id: u32) -> Option<&mut Slot> {
        if task_id & STANDALONE_BIT != 0 {
            self.standalone_lane
                .get_mut((task_id & !STANDALONE_BIT) as usize)
        } else {
            self.conn_lane.get_mut(task_id as usize)
        }
    }

    /// Take a ready task out for polling. `None` for vacant or parked
    /// slots, so stale ready-queue entries are skipped harmlessly.
    pub(crate) fn take_ready(&mut self, task_id: u32) -> Option<TaskFuture> {
        self.slot_mut(task_id)?.take_ready()
    }

    /// Put a task back after it returned `Poll::Pending`.
    pub(crate) fn park(&mut self, task_id: u32, future: TaskFuture) {
        if let Some(slot) = self.slot_mut(task_id) {
            *slot = Slot::Parked(future);
        }
    }

    /// Mark a parked task ready. Returns whether the caller should queue
    /// it for polling.
    pub(crate) fn wake(&mut self, task_id: u32) -> bool {
        self.slot_mut(task_id).is_some_and(Slot::wake)
    }

    /// Drop a task (completed, cancelled, or its connection closed). A
    /// standalone slot returns to the free list only if it was occupied,
    /// so a second remove of the same ID cannot hand the slot out twice.
    pub(crate) fn remove(&mut self, task_id: u32) {
        let Some(slot) = self.slot_mut(task_id) else {
            return;
        };
        let occupied = !matches!(slot, Slot::Vacant);
        *slot = Slot::Vacant;
        if occupied && task_id & STANDALONE_BIT != 0 {
            self.free.push(task_id & !STANDALONE_BIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskFuture {
        Box::pin(std::future::pending::<()>())
    }

    #[test]
    fn conn_task_lifecycle() {
        let mut table = TaskTable::new(4, 0);
        table.spawn_conn(2, noop());

        let future = table.take_ready(2).expect("spawned task is ready");
        assert!(table.take_ready(2).is_none());

        table.park(2, future);
        assert!(table.take_ready(2).is_none(), "parked is not ready");

        assert!(table.wake(2));
        assert!(table.take_ready(2).is_some());
    }

    #[test]
    fn standalone_ids_carry_high_bit() {
        let mut table = TaskTable::new(1, 2);
        let id = table.spawn_standalone(noop()).unwrap();
        assert_ne!(id & STANDALONE_BIT, 0);

        // The encoded ID addresses the standalone lane, not connection 0.
        table.spawn_conn(0, noop());
        assert!(table.take_ready(id).is_some());
        assert!(table.take_ready(0).is_some());
    }

    #[test]
    fn standalone_capacity_and_slot_reuse() {
        let mut table = TaskTable::new(1, 2);
        let a = table.spawn_standalone(noop()).unwrap();
        let _b = table.spawn_standalone(noop()).unwrap();
        assert!(table.spawn_standalone(noop()).is_none(), "lane full");

        table.remove(a);
        assert!(table.spawn_standalone(noop()).is_some());
    }

    #[test]
    fn double_remove_does_not_duplicate_slot() {
        let mut table = TaskTable::new(1, 1);
        let id = table.spawn_standalone(noop()).unwrap();
        table.remove(id);
        table.remove(id);

        assert!(table.spawn_standalone(noop()).is_some());
        assert!(
            table.spawn_standalone(noop()).is_none(),
            "capacity 1 must stay 1 after a double remove"
        );
    }

    #[test]
    fn wake_on_ready_or_vacant_is_not_queued_again() {
        let mut table = TaskTable::new(2, 0);
        table.spawn_conn(0, noop());
        // Ready but not yet taken: already queued.
        assert!(!table.wake(0));
        // Nothing at index 1.
        assert!(!table.wake(1));
        // Out of range.
        assert!(!table.wake(7));
    }

    #[test]
    fn remove_clears_parked_connection_task() {
        let mut table = TaskTable::new(2, 0);
        table.spawn_conn(1, noop());
        let future = table.take_ready(1).unwrap();
        table.park(1, future);

        table.remove(1);
        assert!(!table.wake(1), "removed task cannot be woken");
    }
}
