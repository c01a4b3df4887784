//! Datagram framing around the ack header.
//!
//! A datagram is the [`crate::ack`] header, an optional payload frame, and a
//! trailing checksum:
//!
//! ```text
//! +----------------+---------------------------------------------+----------+
//! | ack header 2|6 | frame (optional)                            | checksum |
//! +----------------+---------------------------------------------+----------+
//!
//! frame, all multi-byte fields big-endian:
//!  serial(2) command(1) flags(1) sender(1) distribution(2) len(2) data(len)
//! ```
//!
//! Total frame header size: [`FRAME_HEADER_LEN`] = 9 bytes.  The checksum is
//! the RFC 1071 Internet checksum over everything before it.  An ack-only
//! datagram is therefore 4 or 8 bytes long.
//!
//! No I/O happens here.

use crate::envelope::Payload;
use crate::error::DecodeError;
use crate::seq::Serial;

/// Byte length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Byte length of the checksum trailer.
pub const CHECKSUM_LEN: usize = 2;

/// Largest `data` a single frame may carry.  Payloads are never split.
pub const MAX_DATA_LEN: usize = 1_200;

// Byte offsets within a frame.
const OFF_SERIAL: usize = 0;
const OFF_COMMAND: usize = 2;
const OFF_FLAGS: usize = 3;
const OFF_SENDER: usize = 4;
const OFF_DISTRIBUTION: usize = 5;
const OFF_LEN: usize = 7;

/// Append a payload frame carrying `serial` to `buf`.
///
/// `payload.data` must not exceed [`MAX_DATA_LEN`]; connections refuse
/// larger payloads at submit time.
pub fn encode_frame(serial: Serial, payload: &Payload, buf: &mut Vec<u8>) {
    let data_len = payload.data.len();
    debug_assert!(data_len <= MAX_DATA_LEN);
    buf.extend_from_slice(&serial.to_wire().to_be_bytes());
    buf.push(payload.command);
    buf.push(payload.flags);
    buf.push(payload.sender);
    buf.extend_from_slice(&payload.distribution.to_be_bytes());
    buf.extend_from_slice(&(data_len as u16).to_be_bytes());
    buf.extend_from_slice(&payload.data);
}

/// Parse the frame following the ack header, if any.
///
/// `reference` is the receiver's next expected serial; the 16-bit wire
/// serial is expanded around it.
pub fn decode_frame(buf: &[u8], reference: Serial) -> Result<Option<(Serial, Payload)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: FRAME_HEADER_LEN,
            available: buf.len(),
        });
    }

    let raw_serial = u16::from_be_bytes([buf[OFF_SERIAL], buf[OFF_SERIAL + 1]]);
    let distribution = u16::from_be_bytes([buf[OFF_DISTRIBUTION], buf[OFF_DISTRIBUTION + 1]]);
    let data_len = u16::from_be_bytes([buf[OFF_LEN], buf[OFF_LEN + 1]]) as usize;

    if buf.len() != FRAME_HEADER_LEN + data_len {
        return Err(DecodeError::LengthMismatch);
    }

    let payload = Payload {
        command: buf[OFF_COMMAND],
        flags: buf[OFF_FLAGS],
        sender: buf[OFF_SENDER],
        distribution,
        data: buf[FRAME_HEADER_LEN..].to_vec(),
    };
    Ok(Some((Serial::from_wire(raw_serial, reference), payload)))
}

/// Append the checksum trailer, completing the datagram in `buf`.
pub fn seal(buf: &mut Vec<u8>) {
    let csum = internet_checksum(buf);
    buf.extend_from_slice(&csum.to_be_bytes());
}

/// Verify the checksum trailer and return the datagram body.
pub fn open(datagram: &[u8]) -> Result<&[u8], DecodeError> {
    let min = crate::ack::CUMULATIVE_LEN + CHECKSUM_LEN;
    if datagram.len() < min {
        return Err(DecodeError::Truncated {
            needed: min,
            available: datagram.len(),
        });
    }
    let (body, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let stored = u16::from_be_bytes([trailer[0], trailer[1]]);
    if internet_checksum(body) != stored {
        return Err(DecodeError::ChecksumFailed);
    }
    Ok(body)
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte, padded with zero on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
