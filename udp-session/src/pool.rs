//! Packet buffer pool interface.
//!
//! The engine never allocates payload buffers on its own authority: every
//! submitted payload is duplicated through a [`PacketPool`] and every
//! retired envelope is handed back with [`PacketPool::release`].  A pool
//! may refuse to duplicate, which is fatal to the requesting connection
//! only.
//!
//! [`BoundedPool`] is the fixed-capacity implementation used by the
//! endpoint and the tests; it counts outstanding buffers so leaks show up
//! as a non-zero [`BoundedPool::outstanding`] after teardown.

use crate::envelope::Payload;

pub trait PacketPool {
    /// Copy `payload` into a pool-owned buffer, or `None` when exhausted.
    fn duplicate(&mut self, payload: &Payload) -> Option<Payload>;

    /// Return a buffer to the pool.
    fn release(&mut self, payload: Payload);

    /// Account for a buffer that entered the engine from the network.
    ///
    /// Returns `false` when the pool has no room for it.
    fn adopt(&mut self, _payload: &Payload) -> bool {
        true
    }
}

/// A pool with a hard cap on the number of live buffers.
#[derive(Debug, Clone)]
pub struct BoundedPool {
    capacity: usize,
    outstanding: usize,
    released: u64,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: 0,
            released: 0,
        }
    }

    /// Buffers currently owned by the engine or the application.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Total buffers returned since construction.
    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accounting for `count` buffers moved out to the application.
    pub fn hand_off(&mut self, count: usize) {
        self.outstanding = self.outstanding.saturating_sub(count);
    }
}

impl PacketPool for BoundedPool {
    fn duplicate(&mut self, payload: &Payload) -> Option<Payload> {
        if self.outstanding >= self.capacity {
            return None;
        }
        self.outstanding += 1;
        Some(payload.clone())
    }

    fn release(&mut self, _payload: Payload) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.released += 1;
    }

    fn adopt(&mut self, _payload: &Payload) -> bool {
        if self.outstanding >= self.capacity {
            return false;
        }
        self.outstanding += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_fails_at_capacity() {
        let mut pool = BoundedPool::new(2);
        let p = Payload::new(7, b"abc".to_vec());
        let a = pool.duplicate(&p).expect("first");
        let _b = pool.duplicate(&p).expect("second");
        assert!(pool.duplicate(&p).is_none());

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.duplicate(&p).is_some());
    }

    #[test]
    fn adopt_counts_against_capacity() {
        let mut pool = BoundedPool::new(1);
        let p = Payload::default();
        assert!(pool.adopt(&p));
        assert!(!pool.adopt(&p));
        pool.release(p);
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}
