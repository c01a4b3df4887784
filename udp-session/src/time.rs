//! Engine time base.
//!
//! The engine never reads a clock itself; every entry point takes the
//! current time as [`Ticks`].  One tick is 4.096 ms (roughly 1/244 s), so
//! the default retransmit timeout of 480 ticks is about two seconds.
//! [`Clock`] converts a monotonic [`Instant`] into ticks for drivers that
//! run against real time.

use std::time::{Duration, Instant};

/// Monotonic engine time.
pub type Ticks = i64;

/// Length of one tick in microseconds.
pub const TICK_MICROS: i64 = 4_096;

/// Convert a tick count to milliseconds, rounding to nearest.
///
/// `t · 4.096` written as `((t << 9) + 256) / 125` to stay in integers.
#[inline]
pub fn ticks_to_millis(t: Ticks) -> i64 {
    ((t << 9) + 256) / 125
}

/// Convert a duration to whole ticks, truncating.
#[inline]
pub fn duration_to_ticks(d: Duration) -> Ticks {
    (d.as_micros() / TICK_MICROS as u128) as Ticks
}

/// Tick source anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Ticks elapsed since the clock was created.
    pub fn now(&self) -> Ticks {
        duration_to_ticks(self.origin.elapsed())
    }
}
