//! Fixed table of connection records owned by one endpoint.
//!
//! Records are created inert when the table is built and reassigned as
//! peers come and go; the table never grows.  Traversal is always in
//! construction order.
//!
//! The desired-peer table passed to [`ConnectionTable::mark_open_connections`]
//! and [`ConnectionTable::open_new_connections`] is indexed by client
//! position: entry `i` belongs to slot `i + 1`, slot 0 being the server.
//! Only the first `MAX_SLOTS - 1` entries can be served: slot ids must fit
//! a 16-bit distribution mask.

use std::net::SocketAddr;

use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionStatus, Outgoing};
use crate::datagram;
use crate::envelope::Payload;
use crate::error::EndpointError;
use crate::host::{is_addressable, slot_bit, ControlPacket, Host, SlotId, SERVER_SLOT};
use crate::pool::PacketPool;
use crate::queue::QueueKind;
use crate::seq::Serial;
use crate::time::Ticks;

/// Largest table a 16-bit distribution mask can address.
pub const MAX_SLOTS: usize = 16;

#[derive(Debug)]
pub struct ConnectionTable {
    connections: Vec<Connection>,
}

impl ConnectionTable {
    /// Build `slots` inert records (at most [`MAX_SLOTS`]).
    pub fn new(slots: usize, config: EngineConfig) -> Self {
        let connections = (0..slots.min(MAX_SLOTS))
            .map(|_| Connection::new(config.clone()))
            .collect();
        Self { connections }
    }

    pub fn capacity(&self) -> usize {
        self.connections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn active_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_active()).count()
    }

    pub fn connection(&self, slot: SlotId) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.is_active() && c.slot() == Some(slot))
    }

    pub fn connection_mut(&mut self, slot: SlotId) -> Option<&mut Connection> {
        self.connections
            .iter_mut()
            .find(|c| c.is_active() && c.slot() == Some(slot))
    }

    pub fn find_by_addr(&mut self, peer: SocketAddr) -> Option<&mut Connection> {
        self.connections
            .iter_mut()
            .find(|c| c.peer() == Some(peer))
    }

    /// Assign `peer` to `slot`.
    ///
    /// A record already bound to `peer` is reopened in place so an address
    /// never holds two connections.  Returns `false` when `slot` does not fit
    /// a distribution mask or no inert record is left.
    pub fn open_slot(
        &mut self,
        slot: SlotId,
        peer: SocketAddr,
        now: Ticks,
        pool: &mut impl PacketPool,
    ) -> bool {
        if !is_addressable(slot) {
            log::warn!("[table] refusing slot {slot} for {peer}");
            return false;
        }
        // A slot belongs to one peer at a time.
        for conn in &mut self.connections {
            if conn.is_active() && conn.slot() == Some(slot) && conn.peer() != Some(peer) {
                conn.close(pool);
            }
        }
        let index = self
            .connections
            .iter()
            .position(|c| c.peer() == Some(peer))
            .or_else(|| self.connections.iter().position(|c| !c.is_active()));
        match index {
            Some(i) => {
                self.connections[i].open(slot, peer, Serial::ZERO, now, pool);
                true
            }
            None => false,
        }
    }

    /// Give an unknown `peer` the lowest unused client slot.
    pub fn accept(
        &mut self,
        peer: SocketAddr,
        now: Ticks,
        pool: &mut impl PacketPool,
    ) -> Option<SlotId> {
        let slot = (1..MAX_SLOTS as SlotId).find(|s| self.connection(*s).is_none())?;
        self.open_slot(slot, peer, now, pool).then_some(slot)
    }

    /// Close every client connection whose peer is missing from `desired`.
    ///
    /// Matched entries are cleared so [`Self::open_new_connections`] only
    /// sees the peers that still need a record.  The server connection is
    /// left alone.
    pub fn mark_open_connections(
        &mut self,
        desired: &mut [Option<SocketAddr>],
        pool: &mut impl PacketPool,
    ) {
        for conn in &mut self.connections {
            let Some(peer) = conn.peer() else { continue };
            if conn.slot() == Some(SERVER_SLOT) {
                continue;
            }
            match desired.iter_mut().find(|entry| **entry == Some(peer)) {
                Some(entry) => *entry = None,
                None => {
                    log::info!("[table] {peer} left the peer table");
                    conn.close(pool);
                }
            }
        }
    }

    /// Hand each remaining `desired` entry to an inert record.
    ///
    /// The slot id is the entry's 1-based position.  Consumed entries are
    /// cleared; entries past the last addressable slot are left in place.
    pub fn open_new_connections(
        &mut self,
        desired: &mut [Option<SocketAddr>],
        now: Ticks,
        pool: &mut impl PacketPool,
    ) {
        let usable = desired.len().min(MAX_SLOTS - 1);
        for conn in &mut self.connections {
            if conn.is_active() {
                continue;
            }
            let Some((i, entry)) = desired[..usable]
                .iter_mut()
                .enumerate()
                .find(|(_, entry)| entry.is_some())
            else {
                break;
            };
            if let Some(peer) = entry.take() {
                conn.open((i + 1) as SlotId, peer, Serial::ZERO, now, pool);
            }
        }
    }

    pub fn status(&self, slot: SlotId) -> Option<ConnectionStatus> {
        self.connection(slot).and_then(Connection::status)
    }

    /// Returns `false` when no active connection holds `slot`.
    pub fn close_slot(&mut self, slot: SlotId, pool: &mut impl PacketPool) -> bool {
        match self.connection_mut(slot) {
            Some(conn) => {
                conn.close(pool);
                true
            }
            None => false,
        }
    }

    /// Close every connection that died since the last call.
    pub fn reap_killed(&mut self, pool: &mut impl PacketPool) -> Vec<SlotId> {
        let mut reaped = Vec::new();
        for conn in &mut self.connections {
            if conn.is_active() && conn.is_killed() {
                if let Some(slot) = conn.slot() {
                    reaped.push(slot);
                }
                conn.close(pool);
            }
        }
        reaped
    }

    /// Apply a control sub-message to the connection at its sender's slot.
    pub fn receive_control(&mut self, packet: ControlPacket) -> bool {
        let Some(conn) = self.connection_mut(packet.sender()) else {
            return false;
        };
        match packet {
            ControlPacket::ConnectionKind { kind, .. } => conn.set_kind(kind),
        }
        true
    }

    pub fn set_routing_mask(&mut self, slot: SlotId, mask: u16) -> bool {
        match self.connection_mut(slot) {
            Some(conn) => {
                conn.set_routing_mask(mask);
                true
            }
            None => false,
        }
    }

    /// Queue `payload` on every connection that serves part of its
    /// distribution.  Bits that were served are cleared from `payload`.
    ///
    /// Returns the number of connections that took a copy.
    pub fn route_packet(&mut self, payload: &mut Payload, host: &mut impl Host) -> usize {
        let mut routed = 0;
        for conn in &mut self.connections {
            if payload.distribution == 0 {
                break;
            }
            let Some(slot) = conn.slot() else { continue };
            if conn.is_killed() {
                continue;
            }
            if payload.distribution & (conn.routing_mask() | slot_bit(slot)) == 0 {
                continue;
            }
            match conn.route(payload, host) {
                Ok(()) => routed += 1,
                Err(e) => log::warn!("[table] slot {slot} dropped a routed payload: {e}"),
            }
        }
        routed
    }

    /// `true` when no connection holds out-of-order data.
    pub fn is_quiescent(&self) -> bool {
        self.connections
            .iter()
            .all(|c| c.queue_len(QueueKind::Reorder) == 0)
    }

    /// Verify and dispatch one datagram from `from`.
    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Ticks,
        host: &mut impl Host,
    ) -> Result<SlotId, EndpointError> {
        let body = datagram::open(bytes)?;
        let conn = self
            .find_by_addr(from)
            .ok_or(EndpointError::UnknownPeer(from))?;
        conn.handle_datagram(body, now, host)?;
        conn.slot().ok_or(EndpointError::UnknownPeer(from))
    }

    /// Run one send tick across the table.
    ///
    /// Each live connection contributes at most one datagram.
    pub fn poll_transmit(&mut self, now: Ticks, host: &mut impl Host) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut out = Vec::new();
        for conn in &mut self.connections {
            let Some(peer) = conn.peer() else { continue };
            if conn.is_killed() {
                continue;
            }
            let (pace, bonus) = (conn.config().pace_interval, conn.config().urgency_bonus);
            let outgoing = match conn.next_outgoing(now, pace, bonus, host) {
                Ok(outgoing) => outgoing,
                Err(e) => {
                    log::warn!("[table] connection to {peer} failed: {e}");
                    continue;
                }
            };
            if outgoing == Outgoing::Nothing {
                continue;
            }
            let mut buf = Vec::with_capacity(datagram::MAX_DATA_LEN);
            if conn.encode_outgoing(outgoing, &mut buf) {
                out.push((peer, buf));
            }
        }
        out
    }
}
