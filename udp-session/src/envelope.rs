//! Payload buffers and the envelopes that carry them through the queues.

use crate::seq::Serial;
use crate::time::Ticks;

/// Bit in [`Payload::flags`] that advances the envelope's scheduling.
pub const URGENT_FLAG: u8 = 0b0000_0001;

/// A pool-owned application datagram.
///
/// Only `flags` (urgency) and `distribution` are interpreted by the engine;
/// the remaining fields belong to the application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub command: u8,
    pub flags: u8,
    /// Slot id of the originating endpoint.
    pub sender: u8,
    /// Bitmask of slots that still have to receive this payload.
    pub distribution: u16,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(command: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn urgent(mut self) -> Self {
        self.flags |= URGENT_FLAG;
        self
    }

    pub fn is_urgent(&self) -> bool {
        self.flags & URGENT_FLAG != 0
    }
}

/// Sequencing metadata wrapped around one [`Payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Assigned when the envelope leaves *pending*; meaningless before.
    pub serial: Serial,
    /// Tick at which the envelope entered *in-flight*.
    pub birth: Ticks,
    /// Earliest tick at which the envelope should be (re)transmitted.
    pub next_send: Ticks,
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload that has not been sequenced yet.
    pub fn unsequenced(payload: Payload) -> Self {
        Self {
            serial: Serial::ZERO,
            birth: 0,
            next_send: 0,
            payload,
        }
    }

    /// Wrap a payload received from the peer under `serial`.
    pub fn received(serial: Serial, payload: Payload) -> Self {
        Self {
            serial,
            ..Self::unsequenced(payload)
        }
    }

    /// `true` once the envelope has been transmitted at least once.
    pub fn has_been_sent(&self) -> bool {
        self.birth != self.next_send
    }

    /// Send time used for scheduling: urgent envelopes are treated as if
    /// they were due `urgency_bonus` ticks earlier.
    pub fn effective_send_time(&self, urgency_bonus: Ticks) -> Ticks {
        if self.payload.is_urgent() {
            self.next_send - urgency_bonus
        } else {
            self.next_send
        }
    }
}
