//! Error types.
//!
//! Nothing the engine reports is fatal to the process.  [`ConnError`] ends
//! one connection; [`DecodeError`] drops one datagram; [`EndpointError`]
//! covers the async driver and its socket.

use std::net::SocketAddr;

use thiserror::Error;

use crate::time::Ticks;

/// Fatal condition for a single connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    #[error("packet pool could not duplicate a payload")]
    PoolExhausted,
    #[error("transmit queue overflow: {queued} envelopes queued, limit {limit}")]
    TransmitOverflow { queued: usize, limit: usize },
    #[error("peer unresponsive: no acknowledgment for {silent_for} ticks")]
    PeerTimedOut { silent_for: Ticks },
    #[error("connection is not assigned to a peer")]
    Unassigned,
    #[error("payload of {len} bytes exceeds the {limit}-byte frame limit")]
    PayloadTooLarge { len: usize, limit: usize },
}

/// A datagram that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("payload length field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
}

/// Errors surfaced by [`crate::endpoint::Endpoint`].
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datagram decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("no connection for peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("no free connection slot")]
    TableFull,
    #[error("slot {0} is outside the 16-bit distribution mask")]
    InvalidSlot(u8),
    #[error("endpoint task has stopped")]
    Closed,
}
