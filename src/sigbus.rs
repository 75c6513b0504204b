//! Fault-queue capability consumed by the cache.
//!
//! Bus faults are delivered asynchronously by the kernel; the surrounding
//! program is expected to capture the faulting addresses (typically from a
//! process-wide SIGBUS handler) and hand them to the cache through this
//! interface. Keeping the queue behind a trait keeps the cache itself free
//! of signal-handler state and testable without installing one.

use std::collections::VecDeque;
use std::io;

/// A drainable queue of captured bus-fault addresses.
pub trait SigbusSource {
    /// Pop one captured faulting address.
    ///
    /// `Ok(None)` means the queue is empty. An `Err` means the capture
    /// mechanism itself failed; the cache treats that as fatal, since it
    /// can no longer tell which mappings are safe to touch.
    fn pop(&mut self) -> io::Result<Option<*mut u8>>;
}

/// Source for programs that never install a SIGBUS handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigbus;

impl SigbusSource for NoSigbus {
    fn pop(&mut self) -> io::Result<Option<*mut u8>> {
        Ok(None)
    }
}

/// Plain FIFO of fault addresses.
///
/// Bridge for embedders that drain a real handler's ring buffer on the
/// program's main loop, and the test double used throughout this crate.
/// Not async-signal-safe itself; push from ordinary code only.
#[derive(Debug, Default)]
pub struct FaultQueue {
    addrs: VecDeque<usize>,
}

impl FaultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, addr: *mut u8) {
        self.addrs.push_back(addr as usize);
    }
}

impl SigbusSource for FaultQueue {
    fn pop(&mut self) -> io::Result<Option<*mut u8>> {
        Ok(self.addrs.pop_front().map(|a| a as *mut u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_push_order_until_empty() {
        let mut q = FaultQueue::new();
        q.push(0x1000 as *mut u8);
        q.push(0x2000 as *mut u8);

        assert_eq!(q.pop().unwrap(), Some(0x1000 as *mut u8));
        assert_eq!(q.pop().unwrap(), Some(0x2000 as *mut u8));
        assert_eq!(q.pop().unwrap(), None);
        assert_eq!(q.pop().unwrap(), None);
    }

    #[test]
    fn no_sigbus_is_always_empty() {
        assert_eq!(NoSigbus.pop().unwrap(), None);
    }
}
