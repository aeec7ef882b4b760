//! Per-connection byte staging.
//!
//! Readiness I/O is partial in both directions. Inbound bytes collect in
//! an accumulator lane per slot so a parser always sees one contiguous
//! slice; outbound bytes sit in a capped staging buffer until the socket
//! takes them. Both tables are separate driver fields so recv and send
//! paths can borrow them independently.

use bytes::{Buf, BytesMut};

/// One inbound accumulator lane per connection slot.
pub struct AccumulatorTable {
    lanes: Vec<BytesMut>,
}

impl AccumulatorTable {
    pub fn new(count: u32, capacity: usize) -> Self {
        let lanes = (0..count)
            .map(|_| BytesMut::with_capacity(capacity))
            .collect();
        AccumulatorTable { lanes }
    }

    /// Add bytes read off the socket.
    pub fn append(&mut self, index: u32, data: &[u8]) {
        self.lanes[index as usize].extend_from_slice(data);
    }

    /// Everything buffered for a slot, contiguous.
    pub fn data(&self, index: u32) -> &[u8] {
        &self.lanes[index as usize]
    }

    /// Drop `n` parsed bytes off the front.
    pub fn consume(&mut self, index: u32, n: usize) {
        let lane = &mut self.lanes[index as usize];
        debug_assert!(n <= lane.len(), "consume({n}) exceeds {} buffered", lane.len());
        lane.advance(n.min(lane.len()));
    }

    /// Discard a slot's buffered bytes on connection teardown.
    pub fn reset(&mut self, index: u32) {
        self.lanes[index as usize].clear();
    }
}

/// Outbound staging for one connection, capped so a stalled peer cannot
/// grow it without bound.
pub struct SendBuffer {
    staged: BytesMut,
    limit: usize,
}

impl SendBuffer {
    pub fn new(limit: usize) -> Self {
        SendBuffer {
            staged: BytesMut::new(),
            limit,
        }
    }

    /// Stage bytes for the socket. Refuses, staging nothing, when the
    /// result would pass the limit; the caller reports `SendBufferFull`.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.staged.len() + data.len() > self.limit {
            return false;
        }
        self.staged.extend_from_slice(data);
        true
    }

    /// Bytes the kernel has not taken yet.
    pub fn pending(&self) -> &[u8] {
        &self.staged
    }

    /// Record a possibly-partial write of `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.staged.len());
        self.staged.advance(n.min(self.staged.len()));
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Drop all pending bytes on connection teardown.
    pub fn reset(&mut self) {
        self.staged.clear();
    }
}

/// One [`SendBuffer`] per connection slot.
pub struct SendBufferTable {
    lanes: Vec<SendBuffer>,
}

impl SendBufferTable {
    pub fn new(count: u32, limit: usize) -> Self {
        let lanes = (0..count).map(|_| SendBuffer::new(limit)).collect();
        SendBufferTable { lanes }
    }

    pub fn get(&self, index: u32) -> &SendBuffer {
        &self.lanes[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut SendBuffer {
        &mut self.lanes[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_lane_collects_and_consumes() {
        let mut table = AccumulatorTable::new(4, 16);
        table.append(2, b"split ");
        table.append(2, b"arrival");
        assert_eq!(table.data(2), b"split arrival");

        table.consume(2, 6);
        assert_eq!(table.data(2), b"arrival");
        assert_eq!(table.data(3), b"", "lanes are independent");
    }

    #[test]
    fn accumulator_grows_past_initial_capacity() {
        let mut table = AccumulatorTable::new(1, 4);
        table.append(0, b"more than four bytes");
        assert_eq!(table.data(0), b"more than four bytes");
    }

    #[test]
    fn accumulator_reset_discards() {
        let mut table = AccumulatorTable::new(1, 16);
        table.append(0, b"leftovers");
        table.reset(0);
        assert_eq!(table.data(0), b"");
    }

    #[test]
    fn send_buffer_survives_partial_writes() {
        let mut buf = SendBuffer::new(64);
        assert!(buf.push(b"response"));
        buf.advance(4);
        assert_eq!(buf.pending(), b"onse");
        buf.advance(4);
        assert!(buf.is_empty());
    }

    #[test]
    fn send_buffer_refuses_past_limit() {
        let mut buf = SendBuffer::new(8);
        assert!(buf.push(b"12345678"));
        assert!(!buf.push(b"x"));
        // A refused push stages nothing.
        assert_eq!(buf.pending(), b"12345678");
        buf.advance(8);
        assert!(buf.push(b"more"));
    }
}
