//! Round-trip estimation and retransmit timeout.
//!
//! A single EMA (RFC 6298 style) inflates the timeout every time one slow
//! sample arrives.  [`RttEstimator`] keeps four tracks instead:
//!
//! - `round_trip`: plain EMA of every sample (shift 6).
//! - `optimist` / `pessimist`: EMAs (shift 5) of the samples at or below,
//!   respectively above, `round_trip`.
//! - `real_round_trip`: EMA (shift 6) of only those samples close to the
//!   optimist track.
//!
//! plus a deviation estimate (shift 4) fed with twice the distance from the
//! optimist track, ignoring outliers further away than the optimist value
//! itself.
//!
//! ```text
//! RTO = ((2 · real + round_trip) >> 1) + deviation,  clamped to [floor, max]
//! ```

use crate::config::EngineConfig;
use crate::time::Ticks;

/// Exponential moving average with weight `1 / 2^shift` on `sample`.
#[inline]
fn ema(old: Ticks, sample: Ticks, shift: u32) -> Ticks {
    ((old << shift) - old + sample) >> shift
}

/// Per-connection round-trip statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttEstimator {
    round_trip: Ticks,
    optimist: Ticks,
    pessimist: Ticks,
    real_round_trip: Ticks,
    deviation: Ticks,
    retransmit: Ticks,
    samples: u64,

    initial_round_trip: Ticks,
    initial_retransmit: Ticks,
    max_retransmit: Ticks,
    rtt_shift: u32,
    deviation_shift: u32,
    pessimist_shift: u32,
}

impl RttEstimator {
    pub fn new(config: &EngineConfig) -> Self {
        let rtt = config.initial_round_trip;
        Self {
            round_trip: rtt,
            optimist: rtt,
            pessimist: rtt,
            real_round_trip: rtt,
            deviation: rtt,
            retransmit: config.initial_retransmit,
            samples: 0,
            initial_round_trip: rtt,
            initial_retransmit: config.initial_retransmit,
            max_retransmit: config.max_retransmit,
            rtt_shift: config.rtt_shift,
            deviation_shift: config.deviation_shift,
            pessimist_shift: config.pessimist_shift,
        }
    }

    /// Forget all samples (fresh peer).
    pub fn reset(&mut self) {
        let rtt = self.initial_round_trip;
        self.round_trip = rtt;
        self.optimist = rtt;
        self.pessimist = rtt;
        self.real_round_trip = rtt;
        self.deviation = rtt;
        self.retransmit = self.initial_retransmit;
        self.samples = 0;
    }

    /// Fold one measured round trip into the estimate.
    ///
    /// `floor` is the owner's minimum resend interval; the timeout never
    /// drops below it.
    pub fn record_sample(&mut self, sample: Ticks, floor: Ticks) {
        if self.samples == 0 {
            self.round_trip = sample;
            self.optimist = sample;
            self.pessimist = sample;
            self.real_round_trip = sample;
        } else {
            if sample > self.round_trip {
                self.pessimist = ema(self.pessimist, sample, self.pessimist_shift);
            } else {
                self.optimist = ema(self.optimist, sample, self.pessimist_shift);
            }

            self.round_trip = ema(self.round_trip, sample, self.rtt_shift);

            let difference = sample - self.optimist;
            if difference <= (self.optimist + self.deviation) >> 2 {
                self.real_round_trip = ema(self.real_round_trip, sample, self.rtt_shift);
            }

            let distance = difference.abs();
            if distance <= self.optimist {
                self.deviation = ema(self.deviation, distance << 1, self.deviation_shift);
            }
        }
        self.samples += 1;

        let rto = ((self.real_round_trip * 2 + self.round_trip) >> 1) + self.deviation;
        self.retransmit = rto.max(floor).min(self.max_retransmit);
    }

    /// Current retransmit timeout.
    pub fn retransmit_time(&self) -> Ticks {
        self.retransmit
    }

    pub fn round_trip(&self) -> Ticks {
        self.round_trip
    }

    pub fn optimist(&self) -> Ticks {
        self.optimist
    }

    pub fn pessimist(&self) -> Ticks {
        self.pessimist
    }

    pub fn real_round_trip(&self) -> Ticks {
        self.real_round_trip
    }

    pub fn deviation(&self) -> Ticks {
        self.deviation
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}
