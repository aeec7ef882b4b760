//! Tuning knobs for the workers and their pollers.
//!
//! Everything here is per worker: each thread sizes its own slot
//! tables, buffers, and timer heap from one shared [`Config`].

use crate::error::Error;

#[derive(Clone)]
pub struct Config {
    /// Thread count and CPU pinning.
    pub worker: WorkerConfig,
    /// Listen backlog passed to `listen(2)`.
    pub backlog: i32,
    /// Connection slots per worker; an accept past this is refused.
    pub max_connections: u32,
    /// Set TCP_NODELAY on accepted and dialed sockets.
    pub tcp_nodelay: bool,
    /// Starting capacity of each inbound accumulator lane. Lanes grow
    /// past this on demand.
    pub read_buffer_capacity: usize,
    /// Cap on a connection's outbound staging buffer, in bytes. A
    /// `send()` that would pass it fails with `SendBufferFull`.
    pub write_buffer_limit: usize,
    /// Events fetched per `epoll_wait` call.
    pub max_events: usize,
    /// Longest `epoll_wait` block, in microseconds, before the loop
    /// re-checks shutdown. The nearest timer deadline shortens it; 0
    /// polls without blocking. Default 1000 (1ms).
    pub poll_timeout_us: u64,
    /// Slots for tasks spawned with [`spawn()`](crate::spawn), which
    /// are not tied to a connection. Default 256.
    pub standalone_task_capacity: u32,
    /// Concurrent timers per worker, shared by
    /// [`sleep()`](crate::sleep) and [`timeout()`](crate::timeout).
    /// Default 256.
    pub timer_slots: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            backlog: 1024,
            max_connections: 16000,
            tcp_nodelay: true,
            read_buffer_capacity: 4096,
            write_buffer_limit: 1 << 20,
            max_events: 256,
            poll_timeout_us: 1000,
            standalone_task_capacity: 256,
            timer_slots: 256,
        }
    }
}

fn require(ok: bool, what: &str) -> Result<(), Error> {
    if ok {
        Ok(())
    } else {
        Err(Error::PollerSetup(what.into()))
    }
}

impl Config {
    /// Reject values the tables cannot represent.
    pub fn validate(&self) -> Result<(), Error> {
        require(
            self.max_connections > 0 && self.max_connections < (1 << 24),
            "max_connections must be > 0 and < 2^24",
        )?;
        // Timer generations pack next to a u16 slot index.
        require(self.timer_slots <= u16::MAX as u32, "timer_slots must be <= 65535")?;
        require(self.max_events > 0, "max_events must be > 0")?;
        require(self.read_buffer_capacity > 0, "read_buffer_capacity must be > 0")?;
        require(self.write_buffer_limit > 0, "write_buffer_limit must be > 0")?;
        // The top task-id bit marks the standalone lane.
        require(
            self.standalone_task_capacity < (1 << 31),
            "standalone_task_capacity must be < 2^31",
        )?;
        Ok(())
    }
}

/// How many threads to run and where to put them.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Worker thread count; 0 means one per online CPU.
    pub threads: usize,
    /// Pin each worker to its own core.
    pub pin_to_core: bool,
    /// First core index used when pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pin_to_core: true,
            core_offset: 0,
        }
    }
}

/// Fluent construction for [`Config`]; `build()` validates.
///
/// # Example
///
/// ```rust
/// use tideline::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .workers(4)
///     .max_connections(8000)
///     .write_buffer_limit(256 * 1024)
///     .timer_slots(1024)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Threads ──────────────────────────────────────────────────────

    /// Worker thread count; 0 means one per online CPU.
    pub fn workers(mut self, count: usize) -> Self {
        self.config.worker.threads = count;
        self
    }

    /// Pin each worker to its own core.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.worker.pin_to_core = enable;
        self
    }

    /// First core index used when pinning.
    pub fn core_offset(mut self, first_core: usize) -> Self {
        self.config.worker.core_offset = first_core;
        self
    }

    // ── Sockets ──────────────────────────────────────────────────────

    /// Connection slots per worker.
    pub fn max_connections(mut self, slots: u32) -> Self {
        self.config.max_connections = slots;
        self
    }

    /// Listen backlog.
    pub fn backlog(mut self, depth: i32) -> Self {
        self.config.backlog = depth;
        self
    }

    /// Set TCP_NODELAY on every socket.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    // ── Buffers and polling ──────────────────────────────────────────

    /// Starting capacity of each inbound accumulator lane.
    pub fn read_buffer_capacity(mut self, bytes: usize) -> Self {
        self.config.read_buffer_capacity = bytes;
        self
    }

    /// Cap on a connection's outbound staging buffer.
    pub fn write_buffer_limit(mut self, bytes: usize) -> Self {
        self.config.write_buffer_limit = bytes;
        self
    }

    /// Events fetched per `epoll_wait` call.
    pub fn max_events(mut self, count: usize) -> Self {
        self.config.max_events = count;
        self
    }

    /// Longest `epoll_wait` block in microseconds; 0 never blocks.
    pub fn poll_timeout_us(mut self, micros: u64) -> Self {
        self.config.poll_timeout_us = micros;
        self
    }

    // ── Tasks and timers ─────────────────────────────────────────────

    /// Slots for tasks not tied to a connection.
    pub fn standalone_task_capacity(mut self, slots: u32) -> Self {
        self.config.standalone_task_capacity = slots;
        self
    }

    /// Concurrent timers per worker.
    pub fn timer_slots(mut self, slots: u32) -> Self {
        self.config.timer_slots = slots;
        self
    }

    /// Direct access for fields without a builder method.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and hand over the [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
