//! Fixed-capacity connection slot table.
//!
//! Slots are addressed by index (which doubles as the connection task's
//! ID) and stamped with a generation so a `ConnCtx` held past close
//! cannot reach whatever reuses the slot. Occupancy is derived from the
//! phase; there is no separate liveness flag to fall out of sync.

use std::io;
use std::net::SocketAddr;

/// Transport phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Outbound connect in flight; the first writable event settles it.
    Connecting,
    /// Ready for traffic; readiness interests may be armed.
    Established,
    /// Vacant or mid-teardown.
    Closed,
}

/// Everything the driver tracks per slot.
pub struct ConnectionState {
    pub phase: ConnPhase,
    /// Bumped on release so stale `ConnCtx` handles miss.
    pub generation: u32,
    /// Dialed out rather than accepted.
    pub outbound: bool,
    /// Socket fd, -1 once closed.
    pub fd: i32,
    pub peer_addr: Option<SocketAddr>,
    /// Peer FIN seen (or fd torn down); no further bytes will arrive.
    pub recv_closed: bool,
    /// Deferred I/O failure, taken by the first future that looks.
    pub error: Option<io::Error>,
}

impl ConnectionState {
    fn vacant() -> Self {
        ConnectionState {
            phase: ConnPhase::Closed,
            generation: 0,
            outbound: false,
            fd: -1,
            peer_addr: None,
            recv_closed: false,
            error: None,
        }
    }

    fn occupied(&self) -> bool {
        self.phase != ConnPhase::Closed
    }

    fn open(&mut self, fd: i32, phase: ConnPhase, outbound: bool) {
        self.phase = phase;
        self.outbound = outbound;
        self.fd = fd;
    }

    /// Back to vacant, one generation later.
    fn clear(&mut self) {
        let next_generation = self.generation.wrapping_add(1);
        *self = ConnectionState::vacant();
        self.generation = next_generation;
    }
}

/// Slot storage with a free list; claim and release are O(1).
pub struct ConnectionTable {
    slots: Vec<ConnectionState>,
    free: Vec<u32>,
}

impl ConnectionTable {
    pub fn new(capacity: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, ConnectionState::vacant);
        // Popping from the back hands out low indices first.
        let free = (0..capacity).rev().collect();
        ConnectionTable { slots, free }
    }

    /// Claim a slot for an accepted socket.
    pub fn allocate(&mut self, fd: i32) -> Option<u32> {
        self.claim(fd, ConnPhase::Established, false)
    }

    /// Claim a slot for a socket whose connect is still in flight.
    pub fn allocate_outbound(&mut self, fd: i32) -> Option<u32> {
        self.claim(fd, ConnPhase::Connecting, true)
    }

    fn claim(&mut self, fd: i32, phase: ConnPhase, outbound: bool) -> Option<u32> {
        let idx = self.free.pop()?;
        self.slots[idx as usize].open(fd, phase, outbound);
        Some(idx)
    }

    /// Return a slot to the free list. A slot that is already vacant
    /// stays put: it must not enter the free list twice.
    pub fn release(&mut self, idx: u32) {
        if let Some(slot) = self.slots.get_mut(idx as usize)
            && slot.occupied()
        {
            slot.clear();
            self.free.push(idx);
        }
    }

    pub fn get(&self, idx: u32) -> Option<&ConnectionState> {
        self.slots.get(idx as usize).filter(|s| s.occupied())
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut ConnectionState> {
        self.slots.get_mut(idx as usize).filter(|s| s.occupied())
    }

    /// Occupied slot count.
    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Capacity in slots.
    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Generation stamp; meaningful for vacant slots too, so a handle
    /// can be checked without first proving occupancy.
    pub fn generation(&self, idx: u32) -> u32 {
        self.slots[idx as usize].generation
    }
}
