//! Local port allocation for process-backed environments

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Hands out free local ports from a fixed range.
///
/// A port is free when no live lease holds it and it can actually be bound,
/// so other programs on the machine are respected too.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    next_port: AtomicU16,
    assigned: Mutex<HashSet<u16>>,
}

/// A reserved port, released when dropped
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.assigned.lock().remove(&self.port);
        debug!(port = self.port, "Port released");
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(*range.start()),
            range,
            assigned: Mutex::new(HashSet::new()),
        })
    }

    /// Reserve the next free port in the range
    pub fn allocate(self: &Arc<Self>) -> Result<PortLease> {
        let start = *self.range.start();
        let end = *self.range.end();
        let span = usize::from(end - start) + 1;

        let mut assigned = self.assigned.lock();
        for _ in 0..span {
            let mut port = self.next_port.fetch_add(1, Ordering::SeqCst);

            // Wrap around if we exceed the range
            if port < start || port > end {
                self.next_port.store(start.wrapping_add(1), Ordering::SeqCst);
                port = start;
            }

            if !assigned.contains(&port) && is_port_available(port) {
                assigned.insert(port);
                debug!(port, "Port allocated");
                return Ok(PortLease {
                    port,
                    allocator: Arc::clone(self),
                });
            }
        }

        Err(Error::config(format!("No available ports in range {}-{}", start, end)))
    }

    /// Number of ports currently leased
    pub fn in_use(&self) -> usize {
        self.assigned.lock().len()
    }
}

/// Check if a port is available
fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
