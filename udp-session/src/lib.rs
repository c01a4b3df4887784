//! `udp-session`: reliable, ordered, multiplexed sessions over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   datagrams   ┌──────────────┐
//!  │ send queues  │──────────────▶│ reorder queue│
//!  └──────┬───────┘               └──────┬───────┘
//!         │   cumulative + selective     │
//!         │◀─────────── acks ────────────┘
//!         │
//!  ┌──────▼──────────────────────────────────────┐
//!  │           Connection  (one per peer)        │
//!  │   serials · RTT estimator · ack state       │
//!  └──────┬──────────────────────────────────────┘
//!         │
//!  ┌──────▼──────────────────────────────────────┐
//!  │  ConnectionTable  (fixed slots, routing)    │
//!  └──────┬──────────────────────────────────────┘
//!         │ sealed datagrams
//!  ┌──────▼──────┐
//!  │  Endpoint   │  (tokio task around a UdpSocket)
//!  └─────────────┘
//! ```
//!
//! The engine (`connection`, `table`) is synchronous and clock-free: time
//! comes in as [`time::Ticks`], datagrams come in and go out as bytes.  The
//! [`endpoint`] drives it from a socket; the [`simulator`] drives it from a
//! seeded fault model in tests.
//!
//! Each module has a single responsibility:
//! - [`seq`]        : wrapping serial arithmetic and 16-bit wire expansion
//! - [`time`]       : tick clock and millisecond conversion
//! - [`config`]     : engine and endpoint tunables
//! - [`envelope`]   : payloads and their sequencing metadata
//! - [`pool`]       : payload buffer accounting
//! - [`queue`]      : arena-backed pending / in-flight / reorder queues
//! - [`rtt`]        : round-trip and retransmit-timeout estimation
//! - [`ack`]        : cumulative + selective acknowledgment header
//! - [`datagram`]   : payload framing and checksum
//! - [`host`]       : the owner-side collaborator trait
//! - [`connection`] : per-peer engine
//! - [`table`]      : fixed connection table
//! - [`simulator`]  : lossy/reorder network for testing
//! - [`socket`]     : async UDP socket abstraction
//! - [`endpoint`]   : async driver and handle

pub mod ack;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod host;
pub mod pool;
pub mod queue;
pub mod rtt;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod table;
pub mod time;

pub use config::{EndpointConfig, EngineConfig};
pub use connection::{Connection, ConnectionStatus, Outgoing};
pub use endpoint::{Endpoint, EndpointHandle, Event};
pub use envelope::Payload;
pub use error::{ConnError, DecodeError, EndpointError};
pub use host::{Host, SlotId};
pub use table::ConnectionTable;
