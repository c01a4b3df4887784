//! Tunable protocol parameters.
//!
//! Every timing value is in [`Ticks`](crate::time::Ticks).  The defaults
//! reproduce the constants the protocol was tuned with for LAN and modem
//! play; drivers may override them (see the CLI flags in `main.rs`).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::time::Ticks;

/// Width of the selective-ack bitmap on the wire.
pub const ACK_BITMAP_SLOTS: usize = 32;

/// Per-connection engine parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Serial increment between consecutive datagrams.  Even, at least 2.
    pub step: i32,
    /// Number of step-sized slots the peer is expected to hold in its
    /// reorder queue.  Envelopes further than this ahead of the last
    /// validated ack are not transmitted.
    pub receive_window: i32,
    /// Upper bound on the *in-flight* queue; exceeding it kills the
    /// connection.
    pub max_transmit_queue: usize,
    pub initial_round_trip: Ticks,
    pub initial_retransmit: Ticks,
    /// Ceiling for the computed retransmit timeout.
    pub max_retransmit: Ticks,
    /// Extra delay added to the forced-ack deadline.
    pub ack_retransmit_base: Ticks,
    /// How long a sent envelope may stay unacknowledged, with no ack at all
    /// arriving, before the peer is presumed dead.
    pub liveness_timeout: Ticks,
    pub rtt_shift: u32,
    pub deviation_shift: u32,
    pub pessimist_shift: u32,
    /// Default pacing allowance handed to selection by the table driver.
    pub pace_interval: Ticks,
    /// Default scheduling advantage of urgent envelopes.
    pub urgency_bonus: Ticks,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step: 2,
            receive_window: 32,
            max_transmit_queue: 128,
            initial_round_trip: 240,
            initial_retransmit: 480,
            max_retransmit: 960,
            ack_retransmit_base: 10,
            liveness_timeout: 7_324 * 4,
            rtt_shift: 6,
            deviation_shift: 4,
            pessimist_shift: 5,
            pace_interval: 0,
            urgency_bonus: 0,
        }
    }
}

impl EngineConfig {
    /// Check the invariants the sequencing logic depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step < 2 || self.step % 2 != 0 {
            return Err(ConfigError::BadStep(self.step));
        }
        if self.receive_window <= 0 || self.receive_window as usize > ACK_BITMAP_SLOTS {
            return Err(ConfigError::BadWindow(self.receive_window));
        }
        if self.max_transmit_queue == 0 {
            return Err(ConfigError::ZeroTransmitQueue);
        }
        // Both windows must fit in half the 16-bit wire space.
        let span = i64::from(self.step) * self.max_transmit_queue as i64;
        if span >= i64::from(i16::MAX) {
            return Err(ConfigError::WireSpanTooLarge(span));
        }
        if self.max_retransmit < self.initial_retransmit {
            return Err(ConfigError::RetransmitCeiling {
                initial: self.initial_retransmit,
                max: self.max_retransmit,
            });
        }
        Ok(())
    }

    pub fn with_liveness_timeout(mut self, ticks: Ticks) -> Self {
        self.liveness_timeout = ticks;
        self
    }

    pub fn with_pacing(mut self, pace_interval: Ticks, urgency_bonus: Ticks) -> Self {
        self.pace_interval = pace_interval;
        self.urgency_bonus = urgency_bonus;
        self
    }
}

/// Parameters of the async [`Endpoint`](crate::endpoint::Endpoint).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bind: SocketAddr,
    /// Number of connection records in the table.
    pub slots: usize,
    /// Slot id this endpoint uses for itself in control messages.
    pub local_slot: u8,
    /// Driver tick period.
    pub tick_interval: Duration,
    /// Lower bound for every connection's retransmit timeout.
    pub urgent_resend_floor: Ticks,
    /// Assign a free slot to datagrams from unknown addresses.
    pub accept_unknown: bool,
    /// Pool capacity in payload buffers.
    pub pool_capacity: usize,
    pub engine: EngineConfig,
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 || self.slots > 16 {
            return Err(ConfigError::BadSlotCount(self.slots));
        }
        if !crate::host::is_addressable(self.local_slot) {
            return Err(ConfigError::BadLocalSlot(self.local_slot));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTickInterval);
        }
        self.engine.validate()
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            slots: 8,
            local_slot: 0,
            tick_interval: Duration::from_millis(4),
            urgent_resend_floor: 12,
            accept_unknown: false,
            pool_capacity: 4_096,
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("serial step must be even and at least 2, got {0}")]
    BadStep(i32),
    #[error("receive window must be in 1..=32 slots, got {0}")]
    BadWindow(i32),
    #[error("transmit queue bound must be non-zero")]
    ZeroTransmitQueue,
    #[error("step x transmit queue ({0}) does not fit the 16-bit wire serial")]
    WireSpanTooLarge(i64),
    #[error("max retransmit {max} is below initial retransmit {initial}")]
    RetransmitCeiling { initial: Ticks, max: Ticks },
    #[error("slot count must be in 1..=16, got {0}")]
    BadSlotCount(usize),
    #[error("local slot must be in 0..16, got {0}")]
    BadLocalSlot(u8),
    #[error("tick interval must be non-zero")]
    ZeroTickInterval,
}
