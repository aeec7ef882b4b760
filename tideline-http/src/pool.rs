//! Bounded two-level connection pool.
//!
//! Permits are counted at two levels: a global cap across every
//! destination and a per-destination cap. [`ConnectionPool::acquire`]
//! takes the global permit first, then the per-destination one; a
//! timeout or cancellation while waiting on the second level releases
//! the global permit before the error surfaces, so counts never leak.
//!
//! The pool is shared across worker threads. Waiters park behind a
//! short mutex-guarded critical section and are woken through stored
//! `Waker`s; inside the tideline executor those come from
//! [`tideline::remote_waker`], which is safe to invoke from whichever
//! thread releases the permit.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use tideline::Elapsed;

use crate::error::HttpError;

/// Permit caps for a [`ConnectionPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Cap across all destinations.
    pub global: usize,
    /// Cap per destination address.
    pub per_host: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Global,
    Dest(SocketAddr),
}

struct Waiter {
    id: u64,
    waker: Waker,
}

struct DestState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
}

struct PoolState {
    closed: bool,
    global_in_use: usize,
    global_waiters: VecDeque<Waiter>,
    dests: HashMap<SocketAddr, DestState>,
    next_waiter_id: u64,
}

struct PoolInner {
    limits: PoolLimits,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Mutex poisoning cannot happen: no critical section panics.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Release one permit at `level` and notify the next waiter in line.
    fn release(&self, level: Level) {
        let mut state = self.lock();
        match level {
            Level::Global => {
                state.global_in_use -= 1;
                if let Some(waiter) = state.global_waiters.front() {
                    waiter.waker.wake_by_ref();
                }
            }
            Level::Dest(dest) => {
                if let Some(entry) = state.dests.get_mut(&dest) {
                    entry.in_use -= 1;
                    if let Some(waiter) = entry.waiters.front() {
                        waiter.waker.wake_by_ref();
                    } else if entry.in_use == 0 {
                        state.dests.remove(&dest);
                    }
                }
            }
        }
    }
}

impl PoolState {
    /// Counter, cap, and waiter queue for one level. `limit` is the
    /// cap the caller resolved for this level.
    fn level_mut(
        &mut self,
        level: Level,
        limit: usize,
    ) -> (&mut usize, usize, &mut VecDeque<Waiter>) {
        match level {
            Level::Global => (&mut self.global_in_use, limit, &mut self.global_waiters),
            Level::Dest(dest) => {
                let entry = self.dests.entry(dest).or_insert_with(|| DestState {
                    in_use: 0,
                    waiters: VecDeque::new(),
                });
                (&mut entry.in_use, limit, &mut entry.waiters)
            }
        }
    }
}

/// Shared handle to a two-level permit pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                limits,
                state: Mutex::new(PoolState {
                    closed: false,
                    global_in_use: 0,
                    global_waiters: VecDeque::new(),
                    dests: HashMap::new(),
                    next_waiter_id: 0,
                }),
            }),
        }
    }

    /// Acquire a permit for `dest`, waiting at most `timeout` across
    /// both levels.
    ///
    /// Must be called from within the tideline executor (the deadline
    /// uses the worker's timer heap).
    pub async fn acquire(
        &self,
        dest: SocketAddr,
        timeout: Duration,
    ) -> Result<PoolPermit, HttpError> {
        let deadline = Instant::now() + timeout;

        let global = match tideline::timeout_at(deadline, self.acquire_level(Level::Global)).await
        {
            Ok(Ok(guard)) => guard,
            Ok(Err(e)) => return Err(e),
            Err(Elapsed) => return Err(HttpError::PoolTimeout),
        };

        let dest_guard =
            match tideline::timeout_at(deadline, self.acquire_level(Level::Dest(dest))).await {
                Ok(Ok(guard)) => guard,
                // `global` drops here, handing its permit back (and
                // notifying the next global waiter) before the error
                // surfaces.
                Ok(Err(e)) => return Err(e),
                Err(Elapsed) => return Err(HttpError::PoolTimeout),
            };

        Ok(PoolPermit::new(global, dest_guard, dest))
    }

    fn acquire_level(&self, level: Level) -> LevelAcquire {
        LevelAcquire {
            pool: Arc::clone(&self.inner),
            level,
            waiter_id: None,
            acquired: false,
        }
    }

    /// Close the pool: pending and future acquires fail with
    /// [`HttpError::PoolClosed`]. Held permits release normally.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        for waiter in state.global_waiters.drain(..) {
            waiter.waker.wake();
        }
        for entry in state.dests.values_mut() {
            for waiter in entry.waiters.drain(..) {
                waiter.waker.wake();
            }
        }
    }

    /// Permits currently held across all destinations.
    pub fn global_in_use(&self) -> usize {
        self.inner.lock().global_in_use
    }

    /// Permits currently held for `dest`.
    pub fn dest_in_use(&self, dest: SocketAddr) -> usize {
        self.inner.lock().dests.get(&dest).map_or(0, |e| e.in_use)
    }

    pub fn limits(&self) -> PoolLimits {
        self.inner.limits
    }
}

/// Single-level acquire. FIFO: a freed permit goes to the longest
/// waiter, and a newcomer cannot overtake a non-empty queue.
struct LevelAcquire {
    pool: Arc<PoolInner>,
    level: Level,
    waiter_id: Option<u64>,
    acquired: bool,
}

impl Future for LevelAcquire {
    type Output = Result<LevelGuard, HttpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let limit = match self.level {
            Level::Global => self.pool.limits.global,
            Level::Dest(_) => self.pool.limits.per_host,
        };
        let pool = Arc::clone(&self.pool);
        let mut state = pool.lock();

        if state.closed {
            if let Some(id) = self.waiter_id.take() {
                let (_, _, waiters) = state.level_mut(self.level, limit);
                waiters.retain(|w| w.id != id);
            }
            return Poll::Ready(Err(HttpError::PoolClosed));
        }

        let level = self.level;
        let waiter_id = self.waiter_id;
        let fresh_id = if waiter_id.is_none() {
            state.next_waiter_id += 1;
            Some(state.next_waiter_id)
        } else {
            None
        };

        let (in_use, limit, waiters) = state.level_mut(level, limit);
        let at_front = match waiter_id {
            Some(id) => waiters.front().is_some_and(|w| w.id == id),
            None => waiters.is_empty(),
        };

        if *in_use < limit && at_front {
            if waiter_id.is_some() {
                waiters.pop_front();
            }
            *in_use += 1;
            // Capacity may admit more than one waiter; pass the wake on.
            if *in_use < limit
                && let Some(next) = waiters.front()
            {
                next.waker.wake_by_ref();
            }
            self.waiter_id = None;
            self.acquired = true;
            return Poll::Ready(Ok(LevelGuard {
                pool: Arc::clone(&self.pool),
                level,
                armed: true,
            }));
        }

        // Park. Inside the executor the stored waker must survive a
        // cross-thread wake; outside (unit tests) the caller's waker is
        // already thread-safe.
        let waker = tideline::remote_waker().unwrap_or_else(|| cx.waker().clone());
        match waiter_id {
            Some(id) => {
                if let Some(w) = waiters.iter_mut().find(|w| w.id == id) {
                    w.waker = waker;
                }
            }
            None => {
                let id = fresh_id.unwrap_or_default();
                waiters.push_back(Waiter { id, waker });
                drop(state);
                self.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for LevelAcquire {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(id) = self.waiter_id else {
            return;
        };
        // Dropped mid-wait (timeout or cancellation): leave the queue,
        // and re-notify in case this waiter absorbed a wake that should
        // now go to the next in line.
        let limit = match self.level {
            Level::Global => self.pool.limits.global,
            Level::Dest(_) => self.pool.limits.per_host,
        };
        let pool = Arc::clone(&self.pool);
        let mut state = pool.lock();
        {
            let (in_use, limit, waiters) = state.level_mut(self.level, limit);
            waiters.retain(|w| w.id != id);
            if *in_use < limit
                && let Some(next) = waiters.front()
            {
                next.waker.wake_by_ref();
            }
        }
        if let Level::Dest(dest) = self.level
            && state
                .dests
                .get(&dest)
                .is_some_and(|e| e.in_use == 0 && e.waiters.is_empty())
        {
            state.dests.remove(&dest);
        }
    }
}

/// One counted permit at one level. Dropping it un-counts the permit;
/// `disarm` transfers ownership into a [`PoolPermit`].
struct LevelGuard {
    pool: Arc<PoolInner>,
    level: Level,
    armed: bool,
}

impl LevelGuard {
    fn disarm(mut self) -> Level {
        self.armed = false;
        self.level
    }
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.level);
        }
    }
}

/// A held two-level permit. Released exactly once, on [`release`]
/// (idempotent) or drop.
///
/// [`release`]: Self::release
pub struct PoolPermit {
    pool: Arc<PoolInner>,
    dest: SocketAddr,
    released: AtomicBool,
}

impl PoolPermit {
    fn new(global: LevelGuard, dest_guard: LevelGuard, dest: SocketAddr) -> Self {
        let pool = Arc::clone(&global.pool);
        global.disarm();
        dest_guard.disarm();
        PoolPermit {
            pool,
            dest,
            released: AtomicBool::new(false),
        }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Hand both permits back and notify waiters. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.release(Level::Dest(self.dest));
        self.pool.release(Level::Global);
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
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

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn poll_acquire(
        fut: &mut LevelAcquire,
        waker: &Waker,
    ) -> Poll<Result<LevelGuard, HttpError>> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn grab(pool: &ConnectionPool, level: Level) -> LevelGuard {
        let (waker, _) = counting_waker();
        let mut fut = pool.acquire_level(level);
        match poll_acquire(&mut fut, &waker) {
            Poll::Ready(Ok(guard)) => guard,
            _ => panic!("expected immediate acquire"),
        }
    }

    #[test]
    fn counts_follow_acquire_and_release() {
        let pool = ConnectionPool::new(PoolLimits {
            global: 4,
            per_host: 2,
        });
        let g1 = grab(&pool, Level::Global);
        let d1 = grab(&pool, Level::Dest(addr(80)));
        assert_eq!(pool.global_in_use(), 1);
        assert_eq!(pool.dest_in_use(addr(80)), 1);

        drop(d1);
        drop(g1);
        assert_eq!(pool.global_in_use(), 0);
        assert_eq!(pool.dest_in_use(addr(80)), 0);
    }

    #[test]
    fn waiter_parks_at_limit_and_wakes_on_release() {
        let pool = ConnectionPool::new(PoolLimits {
            global: 1,
            per_host: 1,
        });
        let held = grab(&pool, Level::Global);

        let (waker, count) = counting_waker();
        let mut waiting = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut waiting, &waker).is_pending());
        assert_eq!(count.0.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            poll_acquire(&mut waiting, &waker),
            Poll::Ready(Ok(_))
        ));
    }

    #[test]
    fn fifo_newcomer_cannot_overtake_waiter() {
        let pool = ConnectionPool::new(PoolLimits {
            global: 1,
            per_host: 1,
        });
        let held = grab(&pool, Level::Global);

        let (w1, _) = counting_waker();
        let mut first = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut first, &w1).is_pending());

        drop(held);

        // A newcomer polled before the woken waiter must queue behind it.
        let (w2, _) = counting_waker();
        let mut second = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut second, &w2).is_pending());

        assert!(matches!(poll_acquire(&mut first, &w1), Poll::Ready(Ok(_))));
    }

    #[test]
    fn abandoned_second_level_wait_returns_global_permit() {
        let dest = addr(443);
        let pool = ConnectionPool::new(PoolLimits {
            global: 8,
            per_host: 1,
        });

        // Fill the per-destination level.
        let _g_held = grab(&pool, Level::Global);
        let _d_held = grab(&pool, Level::Dest(dest));

        // Second acquire: global succeeds, per-dest parks.
        let global = grab(&pool, Level::Global);
        let (waker, _) = counting_waker();
        let mut dest_wait = pool.acquire_level(Level::Dest(dest));
        assert!(poll_acquire(&mut dest_wait, &waker).is_pending());
        assert_eq!(pool.global_in_use(), 2);

        // Timeout path: the pending dest future and the global guard are
        // dropped; the global count must come back.
        drop(dest_wait);
        drop(global);
        assert_eq!(pool.global_in_use(), 1);
        assert_eq!(pool.dest_in_use(dest), 1);
    }

    #[test]
    fn permit_release_is_idempotent() {
        let dest = addr(80);
        let pool = ConnectionPool::new(PoolLimits {
            global: 4,
            per_host: 4,
        });
        let global = grab(&pool, Level::Global);
        let dest_guard = grab(&pool, Level::Dest(dest));
        let permit = PoolPermit::new(global, dest_guard, dest);
        assert_eq!(pool.global_in_use(), 1);

        permit.release();
        permit.release();
        assert_eq!(pool.global_in_use(), 0);
        assert_eq!(pool.dest_in_use(dest), 0);

        drop(permit);
        assert_eq!(pool.global_in_use(), 0);
    }

    #[test]
    fn dropped_waiter_renotifies_next_in_line() {
        let pool = ConnectionPool::new(PoolLimits {
            global: 1,
            per_host: 1,
        });
        let held = grab(&pool, Level::Global);

        let (w1, _) = counting_waker();
        let mut first = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut first, &w1).is_pending());

        let (w2, second_count) = counting_waker();
        let mut second = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut second, &w2).is_pending());

        // Capacity frees; the front waiter absorbs the wake but is
        // dropped before polling. Its exit must pass the wake on.
        drop(held);
        assert_eq!(second_count.0.load(Ordering::SeqCst), 0);
        drop(first);
        assert_eq!(second_count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(poll_acquire(&mut second, &w2), Poll::Ready(Ok(_))));
    }

    #[test]
    fn closed_pool_fails_waiters_and_new_acquires() {
        let pool = ConnectionPool::new(PoolLimits {
            global: 1,
            per_host: 1,
        });
        let held = grab(&pool, Level::Global);

        let (waker, count) = counting_waker();
        let mut waiting = pool.acquire_level(Level::Global);
        assert!(poll_acquire(&mut waiting, &waker).is_pending());

        pool.close();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(matches!(
            poll_acquire(&mut waiting, &waker),
            Poll::Ready(Err(HttpError::PoolClosed))
        ));

        let mut fresh = pool.acquire_level(Level::Global);
        assert!(matches!(
            poll_acquire(&mut fresh, &waker),
            Poll::Ready(Err(HttpError::PoolClosed))
        ));

        drop(held);
    }

    #[test]
    fn per_dest_states_are_cleaned_up() {
        let dest = addr(9000);
        let pool = ConnectionPool::new(PoolLimits {
            global: 4,
            per_host: 4,
        });
        let guard = grab(&pool, Level::Dest(dest));
        assert_eq!(pool.inner.lock().dests.len(), 1);
        drop(guard);
        assert!(pool.inner.lock().dests.is_empty());
    }
}
