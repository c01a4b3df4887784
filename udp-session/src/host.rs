//! The owner-side collaborator of the connection engine.
//!
//! The engine hands in-order payloads upward, asks the owner to broadcast
//! control messages when a connection dies, and reads the owner's resend
//! floor.  Buffer ownership goes through the [`PacketPool`] supertrait.

use crate::envelope::Payload;
use crate::pool::{BoundedPool, PacketPool};
use crate::time::Ticks;

/// Small integer identifying one peer within a table.  Slot 0 is the server.
pub type SlotId = u8;

/// Slot id of the server connection.
pub const SERVER_SLOT: SlotId = 0;

/// Distribution mask addressing only the server.
pub const SERVER_ONLY: u16 = 1 << SERVER_SLOT;

/// Bit for `slot` in a distribution or routing mask; `0` when the slot is
/// outside the mask.
#[inline]
pub fn slot_bit(slot: SlotId) -> u16 {
    1u16.checked_shl(u32::from(slot)).unwrap_or(0)
}

/// `true` when `slot` has its own bit in a 16-bit mask.
#[inline]
pub fn is_addressable(slot: SlotId) -> bool {
    u32::from(slot) < u16::BITS
}

/// Control command numbers the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// The connection to `sender` is gone.
    Logout,
}

/// A control message the owner should deliver to `distribution`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub distribution: u16,
    pub command: ControlCommand,
    pub sender: SlotId,
}

/// Control sub-messages routed to a connection by its sender's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    /// The peer at `sender` announces its connection kind.
    ConnectionKind { sender: SlotId, kind: i16 },
}

impl ControlPacket {
    pub fn sender(&self) -> SlotId {
        match self {
            ControlPacket::ConnectionKind { sender, .. } => *sender,
        }
    }
}

pub trait Host: PacketPool {
    /// In-order payload received on the connection at `from`.
    ///
    /// Ownership of the buffer passes to the host.
    fn deliver(&mut self, from: Option<SlotId>, payload: Payload);

    /// Broadcast a control message to the rest of the table.
    fn send_control(&mut self, message: ControlMessage);

    /// Minimum retransmit timeout for every connection.
    fn urgent_resend_floor(&self) -> Ticks;

    /// Slot id of the local endpoint.
    fn local_slot(&self) -> SlotId;
}

// ---------------------------------------------------------------------------
// In-memory host
// ---------------------------------------------------------------------------

/// A payload delivered in order by the connection at `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: Option<SlotId>,
    pub payload: Payload,
}

/// [`Host`] that buffers deliveries and control messages for the caller to
/// drain after each engine call.
#[derive(Debug)]
pub struct MemoryHost {
    pool: BoundedPool,
    local_slot: SlotId,
    urgent_resend_floor: Ticks,
    inbox: Vec<Delivery>,
    controls: Vec<ControlMessage>,
}

impl MemoryHost {
    pub fn new(local_slot: SlotId, urgent_resend_floor: Ticks, pool_capacity: usize) -> Self {
        Self {
            pool: BoundedPool::new(pool_capacity),
            local_slot,
            urgent_resend_floor,
            inbox: Vec::new(),
            controls: Vec::new(),
        }
    }

    /// Take every delivered payload.  Their buffers leave the pool's books.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        let deliveries = std::mem::take(&mut self.inbox);
        self.pool.hand_off(deliveries.len());
        deliveries
    }

    pub fn take_controls(&mut self) -> Vec<ControlMessage> {
        std::mem::take(&mut self.controls)
    }

    pub fn pool(&self) -> &BoundedPool {
        &self.pool
    }
}

impl PacketPool for MemoryHost {
    fn duplicate(&mut self, payload: &Payload) -> Option<Payload> {
        self.pool.duplicate(payload)
    }

    fn release(&mut self, payload: Payload) {
        self.pool.release(payload);
    }

    fn adopt(&mut self, payload: &Payload) -> bool {
        self.pool.adopt(payload)
    }
}

impl Host for MemoryHost {
    fn deliver(&mut self, from: Option<SlotId>, payload: Payload) {
        self.inbox.push(Delivery { from, payload });
    }

    fn send_control(&mut self, message: ControlMessage) {
        self.controls.push(message);
    }

    fn urgent_resend_floor(&self) -> Ticks {
        self.urgent_resend_floor
    }

    fn local_slot(&self) -> SlotId {
        self.local_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bits() {
        assert_eq!(slot_bit(0), SERVER_ONLY);
        assert_eq!(slot_bit(3), 0b1000);
        assert_eq!(slot_bit(15), 0x8000);
        assert_eq!(slot_bit(16), 0);
        assert!(is_addressable(15));
        assert!(!is_addressable(16));
    }

    #[test]
    fn memory_host_hands_off_deliveries() {
        let mut host = MemoryHost::new(2, 12, 4);
        let p = Payload::new(1, b"x".to_vec());
        assert!(host.adopt(&p));
        host.deliver(Some(0), p);
        assert_eq!(host.pool().outstanding(), 1);

        let got = host.take_deliveries();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, Some(0));
        assert_eq!(host.pool().outstanding(), 0);
        assert!(host.take_deliveries().is_empty());
    }
}
