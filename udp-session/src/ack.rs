//! Cumulative + selective acknowledgment header.
//!
//! Every datagram starts with this header, big-endian:
//!
//! ```text
//!  0               1               2               3               4               5
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    ack serial (low 16 bits) |F|             bitmap (present only when F = 1)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! With `F = 0` the field is the last contiguously received serial.  With
//! `F = 1` it is that same serial with bit 0 set, and bit `k` of the
//! bitmap says `base + (k + 1) · step` is held in the reorder queue.

use crate::config::ACK_BITMAP_SLOTS;
use crate::error::DecodeError;
use crate::seq::Serial;

/// Encoded size of a cumulative-only header.
pub const CUMULATIVE_LEN: usize = 2;
/// Encoded size of a header carrying a bitmap.
pub const SELECTIVE_LEN: usize = 6;

/// Bitmap position of `serial` relative to `base`, if representable.
///
/// Slot `k` covers `base + (k + 1) · step`; anything not on a step
/// boundary or outside the 32 slots has no position.
pub fn bitmap_slot(serial: Serial, base: Serial, step: i32) -> Option<u32> {
    let offset = serial.diff(base);
    if offset <= 0 || offset % step != 0 {
        return None;
    }
    let slot = offset / step - 1;
    if (slot as usize) < ACK_BITMAP_SLOTS {
        Some(slot as u32)
    } else {
        None
    }
}

/// Out-of-order receive state advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectiveAck {
    /// Last contiguously received serial (unflagged).
    pub base: Serial,
    pub bitmap: u32,
}

impl SelectiveAck {
    /// Build from the serials currently held for reordering.
    ///
    /// Returns `None` when nothing is held, i.e. the plain cumulative form
    /// says everything there is to say.  Serials beyond the bitmap are left
    /// out; the peer will retransmit them.
    pub fn from_held<I>(base: Serial, held: I, step: i32) -> Option<Self>
    where
        I: IntoIterator<Item = Serial>,
    {
        let mut any = false;
        let mut bitmap = 0u32;
        for serial in held {
            any = true;
            if let Some(slot) = bitmap_slot(serial, base, step) {
                bitmap |= 1 << slot;
            }
        }
        any.then_some(Self { base, bitmap })
    }
}

/// A decoded or to-be-encoded ack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckHeader {
    Cumulative(Serial),
    Selective(SelectiveAck),
}

impl AckHeader {
    /// The cumulative acknowledgment carried by either form.
    pub fn cumulative(&self) -> Serial {
        match self {
            AckHeader::Cumulative(serial) => *serial,
            AckHeader::Selective(sack) => sack.base,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            AckHeader::Cumulative(_) => CUMULATIVE_LEN,
            AckHeader::Selective(_) => SELECTIVE_LEN,
        }
    }

    /// `true` when the bitmap marks `serial` as received out of order.
    pub fn selectively_acks(&self, serial: Serial, step: i32) -> bool {
        match self {
            AckHeader::Cumulative(_) => false,
            AckHeader::Selective(sack) => bitmap_slot(serial, sack.base, step)
                .is_some_and(|slot| sack.bitmap & (1 << slot) != 0),
        }
    }

    /// Append the wire form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            AckHeader::Cumulative(serial) => {
                buf.extend_from_slice(&serial.without_flag().to_wire().to_be_bytes());
            }
            AckHeader::Selective(sack) => {
                buf.extend_from_slice(&sack.base.with_flag().to_wire().to_be_bytes());
                buf.extend_from_slice(&sack.bitmap.to_be_bytes());
            }
        }
    }

    /// Parse a header from the front of `buf`.
    ///
    /// `reference` is a full serial near the one being acknowledged (the
    /// sender's highest validated ack); it restores the bits the wire drops.
    /// Returns the header and the number of bytes consumed.
    pub fn decode(buf: &[u8], reference: Serial) -> Result<(Self, usize), DecodeError> {
        if buf.len() < CUMULATIVE_LEN {
            return Err(DecodeError::Truncated {
                needed: CUMULATIVE_LEN,
                available: buf.len(),
            });
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let serial = Serial::from_wire(raw & !1, reference);

        if raw & 1 == 0 {
            return Ok((AckHeader::Cumulative(serial), CUMULATIVE_LEN));
        }

        if buf.len() < SELECTIVE_LEN {
            return Err(DecodeError::Truncated {
                needed: SELECTIVE_LEN,
                available: buf.len(),
            });
        }
        let bitmap = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        Ok((
            AckHeader::Selective(SelectiveAck {
                base: serial,
                bitmap,
            }),
            SELECTIVE_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: i32 = 2;

    #[test]
    fn bitmap_slot_bounds() {
        let base = Serial(-2);
        assert_eq!(bitmap_slot(Serial(0), base, STEP), Some(0));
        assert_eq!(bitmap_slot(Serial(2), base, STEP), Some(1));
        assert_eq!(bitmap_slot(Serial(62), base, STEP), Some(31));
        assert_eq!(bitmap_slot(Serial(64), base, STEP), None);
        assert_eq!(bitmap_slot(Serial(-2), base, STEP), None);
        assert_eq!(bitmap_slot(Serial(-4), base, STEP), None);
        assert_eq!(bitmap_slot(Serial(1), base, STEP), None);
    }

    #[test]
    fn selective_from_held_serials() {
        let sack = SelectiveAck::from_held(Serial(0), [Serial(4), Serial(8)], STEP)
            .expect("non-empty");
        assert_eq!(sack.base, Serial(0));
        assert_eq!(sack.bitmap, 0b1010);
        assert!(SelectiveAck::from_held(Serial(0), [], STEP).is_none());
    }

    #[test]
    fn cumulative_wire_form() {
        let mut buf = Vec::new();
        AckHeader::Cumulative(Serial(0x0102)).encode(&mut buf);
        assert_eq!(buf, vec![0x01, 0x02]);

        let (hdr, used) = AckHeader::decode(&buf, Serial(0x0100)).unwrap();
        assert_eq!(used, CUMULATIVE_LEN);
        assert_eq!(hdr, AckHeader::Cumulative(Serial(0x0102)));
    }

    #[test]
    fn selective_wire_form_sets_flag_bit() {
        let hdr = AckHeader::Selective(SelectiveAck {
            base: Serial(-2),
            bitmap: 0b11,
        });
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), SELECTIVE_LEN);
        assert_eq!(&buf[..2], &[0xff, 0xff]);
        assert_eq!(&buf[2..], &[0, 0, 0, 3]);

        let (decoded, used) = AckHeader::decode(&buf, Serial(-2)).unwrap();
        assert_eq!(used, SELECTIVE_LEN);
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.cumulative(), Serial(-2));
    }

    #[test]
    fn selectively_acks_only_set_bits() {
        let hdr = AckHeader::Selective(SelectiveAck {
            base: Serial(10),
            bitmap: 0b101,
        });
        assert!(hdr.selectively_acks(Serial(12), STEP));
        assert!(!hdr.selectively_acks(Serial(14), STEP));
        assert!(hdr.selectively_acks(Serial(16), STEP));
        assert!(!hdr.selectively_acks(Serial(10), STEP));
        assert!(!hdr.selectively_acks(Serial(200), STEP));
        assert!(!AckHeader::Cumulative(Serial(10)).selectively_acks(Serial(12), STEP));
    }

    #[test]
    fn truncated_headers_rejected() {
        assert_eq!(
            AckHeader::decode(&[0x00], Serial(0)),
            Err(DecodeError::Truncated {
                needed: 2,
                available: 1
            })
        );
        assert_eq!(
            AckHeader::decode(&[0x00, 0x01, 0xaa], Serial(0)),
            Err(DecodeError::Truncated {
                needed: 6,
                available: 3
            })
        );
    }
}
