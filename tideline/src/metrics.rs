//! tideline runtime metrics.
//!
//! Counters for connections, bytes, poller activity, and timer
//! exhaustion, exposed through metriken for Prometheus scraping.
//!
//! Workers increment on every read, write, and poll, so each counter
//! shards its storage per worker: [`bind_worker_shard`] maps the thread
//! onto its own cache-line-aligned cell at worker startup, and reads sum
//! across the shards. Threads that never bind (none in practice — only
//! workers touch these counters) fall back to shard 0.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use metriken::{Gauge, metric};

/// Upper bound on distinct shards; worker IDs wrap beyond it, which
/// merely reintroduces sharing between the wrapped workers.
const MAX_SHARDS: usize = 64;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(0) };
}

/// Bind the current thread to its counter shard. Called once per worker
/// thread before the event loop starts.
pub(crate) fn bind_worker_shard(worker_id: usize) {
    SHARD.set(worker_id % MAX_SHARDS);
}

#[repr(align(128))]
struct ShardCell(AtomicU64);

/// A counter with one padded cell per worker, so hot-path increments
/// from different workers never contend on a cache line.
pub struct WorkerCounter {
    shards: [ShardCell; MAX_SHARDS],
}

impl WorkerCounter {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const fn new() -> Self {
        const ZERO: ShardCell = ShardCell(AtomicU64::new(0));
        WorkerCounter {
            shards: [ZERO; MAX_SHARDS],
        }
    }

    #[inline]
    pub(crate) fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub(crate) fn add(&self, value: u64) {
        self.shards[SHARD.get()].0.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value, summed across all worker shards.
    pub fn value(&self) -> u64 {
        self.shards
            .iter()
            .map(|cell| cell.0.load(Ordering::Relaxed))
            .sum()
    }
}

impl metriken::Metric for WorkerCounter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(WorkerCounter::value(self)))
    }
}

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "tideline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: WorkerCounter = WorkerCounter::new();

#[metric(
    name = "tideline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: WorkerCounter = WorkerCounter::new();

#[metric(
    name = "tideline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "tideline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: WorkerCounter = WorkerCounter::new();

#[metric(name = "tideline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: WorkerCounter = WorkerCounter::new();

// ── Poller activity ──────────────────────────────────────────────

#[metric(name = "tideline/poller/polls", description = "Total epoll_wait calls")]
pub static POLLER_POLLS: WorkerCounter = WorkerCounter::new();

#[metric(
    name = "tideline/poller/wakeups",
    description = "Cross-thread poller wakeups delivered"
)]
pub static POLLER_WAKEUPS: WorkerCounter = WorkerCounter::new();

#[metric(
    name = "tideline/poller/registrations",
    description = "Interest registrations processed"
)]
pub static POLLER_REGISTRATIONS: WorkerCounter = WorkerCounter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(
    name = "tideline/timers/exhausted",
    description = "Timer table exhaustion events"
)]
pub static TIMERS_EXHAUSTED: WorkerCounter = WorkerCounter::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read_back() {
        static C: WorkerCounter = WorkerCounter::new();
        assert_eq!(C.value(), 0);
        C.increment();
        C.add(9);
        assert_eq!(C.value(), 10);
    }

    #[test]
    fn value_sums_across_worker_shards() {
        static C: WorkerCounter = WorkerCounter::new();

        let handles: Vec<_> = (0..4)
            .map(|worker_id| {
                std::thread::spawn(move || {
                    bind_worker_shard(worker_id);
                    for _ in 0..500 {
                        C.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(C.value(), 2000);
    }

    #[test]
    fn shard_ids_wrap_at_the_bound() {
        static C: WorkerCounter = WorkerCounter::new();

        // Same shard twice: both increments land in one cell, the sum
        // still counts both.
        std::thread::spawn(|| {
            bind_worker_shard(1);
            C.increment();
        })
        .join()
        .unwrap();
        std::thread::spawn(|| {
            bind_worker_shard(1 + MAX_SHARDS);
            C.increment();
        })
        .join()
        .unwrap();

        assert_eq!(C.value(), 2);
    }

    #[test]
    fn exposed_as_metriken_counter() {
        use metriken::Metric;

        static C: WorkerCounter = WorkerCounter::new();
        C.add(42);
        assert!(matches!(
            Metric::value(&C),
            Some(metriken::Value::Counter(42))
        ));
    }
}
