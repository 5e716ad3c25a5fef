/*
 *  vmdev serial port plugin - queue pair
 *
 *  Bounded byte FIFOs shared between the host feed and the guest's
 *  MMIO accesses.
 */

use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity of each direction's FIFO, in bytes.
pub const QUEUE_CAPACITY: usize = 4096;

/// Poll flag: the receive queue holds at least one byte.
pub const RX_READY: u32 = 1 << 0;
/// Poll flag: the transmit queue has room for at least one byte.
pub const TX_SPACE: u32 = 1 << 1;

struct ByteQueue {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ByteQueue {
    fn with_capacity(cap: usize) -> Self {
        Self { buf: VecDeque::with_capacity(cap), cap }
    }

    /// Append as many bytes as fit; the rest are dropped. Never blocks.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let room = self.cap - self.buf.len();
        let accepted = bytes.len().min(room);
        self.buf.extend(&bytes[..accepted]);
        accepted
    }

    fn pop(&mut self, max: usize) -> Vec<u8> {
        let count = max.min(self.buf.len());
        self.buf.drain(..count).collect()
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn has_room(&self) -> bool {
        self.buf.len() < self.cap
    }
}

/// Two independent bounded FIFOs: receive (host -> guest) and transmit
/// (guest -> host). Each direction has its own lock; no operation ever
/// holds both, so the two flows stay unordered relative to each other —
/// they model physically independent wires.
pub struct QueuePair {
    rx: Mutex<ByteQueue>,
    tx: Mutex<ByteQueue>,
}

impl QueuePair {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            rx: Mutex::new(ByteQueue::with_capacity(cap)),
            tx: Mutex::new(ByteQueue::with_capacity(cap)),
        }
    }

    /// Host side: feed bytes toward the guest. Returns how many were
    /// accepted — overrun truncates, it does not block or error.
    pub fn push_rx(&self, bytes: &[u8]) -> usize {
        self.rx.lock().unwrap().push(bytes)
    }

    /// Guest side: drain received bytes in FIFO order.
    pub fn pop_rx(&self, max: usize) -> Vec<u8> {
        self.rx.lock().unwrap().pop(max)
    }

    /// Guest side: queue bytes for transmission, truncating when full.
    pub fn push_tx(&self, bytes: &[u8]) -> usize {
        self.tx.lock().unwrap().push(bytes)
    }

    /// Host side: drain transmitted bytes in FIFO order; returns whatever
    /// is available, possibly nothing.
    pub fn pop_tx(&self, max: usize) -> Vec<u8> {
        self.tx.lock().unwrap().pop(max)
    }

    /// Current flag bitmask. Each queue's lock is taken briefly on its
    /// own, never both at once.
    pub fn poll(&self) -> u32 {
        let mut flags = 0;
        if !self.rx.lock().unwrap().is_empty() {
            flags |= RX_READY;
        }
        if self.tx.lock().unwrap().has_room() {
            flags |= TX_SPACE;
        }
        flags
    }
}

impl Default for QueuePair {
    fn default() -> Self {
        Self::new()
    }
}
