//! Serial-number arithmetic.
//!
//! Serials advance by a fixed even step; bit 0 is never part of a packet
//! identity because the ack header borrows it as the selective-ack flag.
//! Ordering is defined by the signed difference of two serials, so it is
//! only meaningful while both values are less than `i32::MAX` apart.  The
//! window bounds in [`crate::config::EngineConfig`] keep that true.
//!
//! On the wire serials are truncated to 16 bits.  [`Serial::from_wire`]
//! recovers the full value given a nearby reference, the same trick QUIC
//! uses for truncated packet numbers.

use std::fmt;

/// A per-direction datagram serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Serial(pub i32);

impl Serial {
    pub const ZERO: Serial = Serial(0);

    /// Signed distance `self − other` in wrap-around space.
    #[inline]
    pub fn diff(self, other: Serial) -> i32 {
        self.0.wrapping_sub(other.0)
    }

    /// `true` when `self` is strictly ahead of `other`.
    #[inline]
    pub fn is_ahead_of(self, other: Serial) -> bool {
        self.diff(other) > 0
    }

    /// `true` when `self` is at or behind `other`.
    #[inline]
    pub fn is_at_or_behind(self, other: Serial) -> bool {
        self.diff(other) <= 0
    }

    #[inline]
    pub fn advance(self, step: i32) -> Serial {
        Serial(self.0.wrapping_add(step))
    }

    #[inline]
    pub fn retreat(self, step: i32) -> Serial {
        Serial(self.0.wrapping_sub(step))
    }

    /// `true` when bit 0 (the selective-ack flag) is set.
    #[inline]
    pub fn is_flagged(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn with_flag(self) -> Serial {
        Serial(self.0 | 1)
    }

    #[inline]
    pub fn without_flag(self) -> Serial {
        Serial(self.0 & !1)
    }

    /// Low 16 bits as carried in the 2-byte wire fields.
    #[inline]
    pub fn to_wire(self) -> u16 {
        self.0 as u16
    }

    /// Expand a truncated 16-bit serial to the full value closest to
    /// `reference`.
    ///
    /// Correct whenever the true serial lies within ±2^15 of `reference`.
    pub fn from_wire(raw: u16, reference: Serial) -> Serial {
        let delta = raw.wrapping_sub(reference.to_wire()) as i16;
        Serial(reference.0.wrapping_add(i32::from(delta)))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ahead_of_is_strict() {
        assert!(Serial(4).is_ahead_of(Serial(2)));
        assert!(!Serial(2).is_ahead_of(Serial(2)));
        assert!(!Serial(0).is_ahead_of(Serial(2)));
        assert!(Serial(0).is_ahead_of(Serial(-2)));
    }

    #[test]
    fn comparison_survives_i32_wrap() {
        let before = Serial(i32::MAX - 1);
        let after = before.advance(4);
        assert!(after.0 < 0);
        assert!(after.is_ahead_of(before));
        assert!(before.is_at_or_behind(after));
        assert_eq!(after.diff(before), 4);
    }

    #[test]
    fn flag_bit_round_trip() {
        let base = Serial(-2).with_flag();
        assert!(base.is_flagged());
        assert_eq!(base.0, -1);
        assert_eq!(base.without_flag(), Serial(-2));
    }

    #[test]
    fn wire_expansion_near_reference() {
        let reference = Serial(70_000);
        for offset in [-300, -2, 0, 2, 128, 300] {
            let truth = reference.advance(offset);
            assert_eq!(Serial::from_wire(truth.to_wire(), reference), truth);
        }
    }

    #[test]
    fn wire_expansion_of_negative_initial_ack() {
        // A fresh receiver acknowledges -2 ("nothing yet").
        let raw = Serial(-2).to_wire();
        assert_eq!(raw, 0xfffe);
        assert_eq!(Serial::from_wire(raw, Serial(-2)), Serial(-2));
        assert_eq!(Serial::from_wire(raw, Serial(10)), Serial(-2));
    }
}
