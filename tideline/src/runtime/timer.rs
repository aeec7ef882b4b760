//! Timer slots over a monotonic deadline heap.
//!
//! A readiness loop has no kernel timer op, so deadlines live in a
//! min-heap that bounds the poll timeout. Slots are generation-stamped:
//! releasing a slot bumps its generation, and heap entries carrying a
//! stale generation are skipped when they surface. That makes cancel
//! (dropping a sleep future) O(1) — the heap entry is simply left to
//! expire.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    slot: u16,
    generation: u32,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.slot.cmp(&other.slot))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed-capacity table of pending timers with a free list.
pub(crate) struct TimerTable {
    /// Task id to wake when the slot fires.
    waker_ids: Vec<u32>,
    fired: Vec<bool>,
    active: Vec<bool>,
    generations: Vec<u32>,
    free_list: Vec<u16>,
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerTable {
    pub(crate) fn new(capacity: u32) -> Self {
        let cap = capacity as usize;
        TimerTable {
            waker_ids: vec![0; cap],
            fired: vec![false; cap],
            active: vec![false; cap],
            generations: vec![0; cap],
            free_list: (0..capacity as u16).rev().collect(),
            heap: BinaryHeap::new(),
        }
    }

    /// Allocate a slot for `deadline`, waking `task_id` when it fires.
    /// Returns `(slot, generation)`, or None when the table is full.
    pub(crate) fn allocate(&mut self, deadline: Instant, task_id: u32) -> Option<(u16, u32)> {
        let slot = self.free_list.pop()?;
        let idx = slot as usize;
        self.waker_ids[idx] = task_id;
        self.fired[idx] = false;
        self.active[idx] = true;
        let generation = self.generations[idx];
        self.heap.push(Reverse(TimerEntry {
            deadline,
            slot,
            generation,
        }));
        Some((slot, generation))
    }

    /// Release a slot. A stale `(slot, generation)` pair is ignored, so
    /// release after fire is safe. Bumps the generation, orphaning any
    /// heap entry still in flight.
    pub(crate) fn release(&mut self, slot: u16, generation: u32) {
        let idx = slot as usize;
        if idx >= self.active.len() || !self.active[idx] || self.generations[idx] != generation {
            return;
        }
        self.active[idx] = false;
        self.fired[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_list.push(slot);
    }

    /// Re-point a pending slot at a (possibly different) task id. Sleep
    /// futures call this on every poll since the owning task can change
    /// (e.g. a future moved into a standalone task).
    pub(crate) fn update_waker(&mut self, slot: u16, generation: u32, task_id: u32) {
        let idx = slot as usize;
        if self.active[idx] && self.generations[idx] == generation {
            self.waker_ids[idx] = task_id;
        }
    }

    pub(crate) fn is_fired(&self, slot: u16, generation: u32) -> bool {
        let idx = slot as usize;
        self.active[idx] && self.generations[idx] == generation && self.fired[idx]
    }

    /// Mark every slot with `deadline <= now` fired and hand its task id
    /// to `wake`. Slots are not released here; the owning future releases
    /// on completion or drop.
    pub(crate) fn fire_due(&mut self, now: Instant, mut wake: impl FnMut(u32)) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let idx = entry.slot as usize;
            if !self.active[idx] || self.generations[idx] != entry.generation {
                continue; // cancelled
            }
            if !self.fired[idx] {
                self.fired[idx] = true;
                wake(self.waker_ids[idx]);
            }
        }
    }

    /// Earliest live deadline. Stale heads are discarded on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.heap.peek() {
            let idx = head.slot as usize;
            if self.active[idx] && self.generations[idx] == head.generation && !self.fired[idx] {
                return Some(head.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn available(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allocate_fire_release() {
        let mut table = TimerTable::new(4);
        let now = Instant::now();
        let (slot, generation) = table.allocate(now, 7).unwrap();
        assert!(!table.is_fired(slot, generation));

        let mut woken = Vec::new();
        table.fire_due(now, |id| woken.push(id));
        assert_eq!(woken, vec![7]);
        assert!(table.is_fired(slot, generation));

        table.release(slot, generation);
        assert_eq!(table.available(), 4);
    }

    #[test]
    fn future_deadline_not_fired() {
        let mut table = TimerTable::new(4);
        let now = Instant::now();
        let deadline = now + Duration::from_secs(60);
        table.allocate(deadline, 1).unwrap();

        let mut woken = Vec::new();
        table.fire_due(now, |id| woken.push(id));
        assert!(woken.is_empty());
        assert_eq!(table.next_deadline(), Some(deadline));
    }

    #[test]
    fn released_slot_entry_is_stale() {
        let mut table = TimerTable::new(2);
        let now = Instant::now();
        let (slot, generation) = table.allocate(now, 3).unwrap();
        table.release(slot, generation);

        // The heap entry survives but must not fire or bound the timeout.
        assert_eq!(table.next_deadline(), None);
        let mut woken = Vec::new();
        table.fire_due(now + Duration::from_secs(1), |id| woken.push(id));
        assert!(woken.is_empty());
    }

    #[test]
    fn stale_release_does_not_touch_reused_slot() {
        let mut table = TimerTable::new(1);
        let now = Instant::now();
        let (slot, g0) = table.allocate(now + Duration::from_secs(1), 1).unwrap();
        table.release(slot, g0);

        let (slot2, g1) = table.allocate(now + Duration::from_secs(2), 2).unwrap();
        assert_eq!(slot, slot2);
        // Releasing with the old generation must be a no-op.
        table.release(slot, g0);
        assert_eq!(table.available(), 0);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(2)));
        table.release(slot2, g1);
    }

    #[test]
    fn exhaustion() {
        let mut table = TimerTable::new(1);
        let now = Instant::now();
        let (slot, generation) = table.allocate(now, 0).unwrap();
        assert!(table.allocate(now, 1).is_none());
        table.release(slot, generation);
        assert!(table.allocate(now, 1).is_some());
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut table = TimerTable::new(4);
        let now = Instant::now();
        table.allocate(now + Duration::from_millis(30), 30).unwrap();
        table.allocate(now + Duration::from_millis(10), 10).unwrap();
        table.allocate(now + Duration::from_millis(20), 20).unwrap();

        let mut woken = Vec::new();
        table.fire_due(now + Duration::from_millis(25), |id| woken.push(id));
        assert_eq!(woken, vec![10, 20]);
        assert_eq!(
            table.next_deadline(),
            Some(now + Duration::from_millis(30))
        );
    }
}
