//! Zero-allocation wakers for the single-threaded executor.
//!
//! A waker carries nothing but an encoded task ID (see
//! [`task::STANDALONE_BIT`](crate::runtime::task::STANDALONE_BIT)) in
//! its data pointer. Waking pushes the ID onto a thread-local queue the
//! executor drains between poll batches; no heap allocation, nothing to
//! drop. These wakers are only meaningful on the worker thread that owns
//! the task — completions signalled from another thread go through
//! [`remote_waker()`](crate::remote_waker) instead.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

thread_local! {
    /// IDs of tasks woken since the executor last drained.
    pub(crate) static READY_QUEUE: RefCell<VecDeque<u32>> =
        const { RefCell::new(VecDeque::new()) };
}

/// Build a waker for an encoded task ID.
pub(crate) fn task_waker(task_id: u32) -> Waker {
    // SAFETY: the vtable never dereferences the data pointer — it is the
    // task ID in disguise, round-tripped through usize.
    unsafe { Waker::from_raw(RawWaker::new(task_id as usize as *const (), &VTABLE)) }
}

/// Move everything woken since the last drain into `buf`.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u32>) {
    READY_QUEUE.with(|q| {
        buf.append(&mut q.borrow_mut());
    });
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, push_id, push_id, drop_raw);

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

// Serves as both wake and wake_by_ref: there is nothing to consume.
unsafe fn push_id(data: *const ()) {
    let task_id = data as usize as u32;
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(task_id);
    });
}

unsafe fn drop_raw(_data: *const ()) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::STANDALONE_BIT;

    fn drained() -> VecDeque<u32> {
        let mut buf = VecDeque::new();
        drain_ready_queue(&mut buf);
        buf
    }

    #[test]
    fn id_rides_the_data_pointer() {
        READY_QUEUE.with(|q| q.borrow_mut().clear());

        task_waker(42).wake();
        task_waker(6 | STANDALONE_BIT).wake();

        let buf = drained();
        assert_eq!(buf, [42, 6 | STANDALONE_BIT]);
    }

    #[test]
    fn clones_wake_the_same_task() {
        READY_QUEUE.with(|q| q.borrow_mut().clear());

        let waker = task_waker(7);
        let clone = waker.clone();
        waker.wake_by_ref();
        clone.wake();
        drop(waker);

        assert_eq!(drained(), [7, 7]);
    }

    #[test]
    fn drain_leaves_queue_empty() {
        READY_QUEUE.with(|q| q.borrow_mut().clear());

        task_waker(3).wake();
        assert_eq!(drained().len(), 1);
        assert!(drained().is_empty());
    }
}
