//! Per-peer connection engine.
//!
//! A [`Connection`] owns everything one peer session needs:
//! - outgoing sequencing: *pending* → [`Connection::promote`] →
//!   *in-flight* → [`Connection::select_next`];
//! - the [`RttEstimator`] fed by acknowledgments;
//! - incoming sequencing: the *reorder* queue and the selective-ack state
//!   advertised back to the peer.
//!
//! The connection performs no I/O and never reads a clock.  A driver calls
//! [`Connection::next_outgoing`] once per tick and encodes what it returns
//! with [`Connection::encode_outgoing`], and hands every inbound datagram
//! body to [`Connection::handle_datagram`].
//!
//! ```text
//!  submit ──▶ pending ──promote──▶ in-flight ──select──▶ transport
//!                                     ▲   │
//!                       ack header ───┘   └── validate ──▶ pool
//!
//!  transport ──▶ on_receive ──▶ reorder ──drain──▶ Host::deliver
//! ```

use std::net::SocketAddr;

use crate::ack::{AckHeader, SelectiveAck};
use crate::config::EngineConfig;
use crate::datagram;
use crate::envelope::{Envelope, Payload};
use crate::error::{ConnError, DecodeError};
use crate::host::{slot_bit, ControlCommand, ControlMessage, Host, SlotId, SERVER_ONLY, SERVER_SLOT};
use crate::pool::PacketPool;
use crate::queue::{EnvelopeId, QueueKind, Queues};
use crate::rtt::RttEstimator;
use crate::seq::Serial;
use crate::time::{ticks_to_millis, Ticks};

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing {
    /// Nothing to send this tick.
    Nothing,
    /// Send a datagram with only the ack header.
    AckOnly,
    /// Send this in-flight envelope (it stays queued until acknowledged).
    Envelope(EnvelopeId),
}

/// Snapshot reported by [`Connection::status`].  Times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub peer: SocketAddr,
    pub estimated_round_trip: i64,
    pub average_round_trip: i64,
    pub pessimist_round_trip: i64,
    pub optimist_round_trip: i64,
    pub kind: i16,
}

/// One peer session.
#[derive(Debug)]
pub struct Connection {
    config: EngineConfig,

    slot: Option<SlotId>,
    peer: Option<SocketAddr>,

    /// Serial the next promoted envelope receives.
    serial: Serial,
    /// Highest cumulative ack received from the peer.
    max_valid: Serial,
    /// Next serial expected from the peer.
    receive_serial: Serial,

    queues: Queues,
    rtt: RttEstimator,

    ack_pending: bool,
    next_ack_time: Ticks,
    next_write_time: Ticks,
    /// Tick of the last ack header received.
    valid_time: Ticks,
    /// Out-of-order state advertised to the peer; `None` when nothing is held.
    selective: Option<SelectiveAck>,

    routing_mask: u16,
    kind: i16,
    killed: bool,
}

impl Connection {
    /// An inert connection record, not yet assigned to a peer.
    pub fn new(config: EngineConfig) -> Self {
        let rtt = RttEstimator::new(&config);
        let step = config.step;
        Self {
            config,
            slot: None,
            peer: None,
            serial: Serial::ZERO,
            max_valid: Serial::ZERO.retreat(step),
            receive_serial: Serial::ZERO,
            queues: Queues::new(),
            rtt,
            ack_pending: false,
            next_ack_time: 0,
            next_write_time: 0,
            valid_time: 0,
            selective: None,
            routing_mask: 0,
            kind: 0,
            killed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Assign this record to `peer` at `slot` and reset all sequencing state.
    ///
    /// `first_receive` is the first serial expected from the peer.
    pub fn open(
        &mut self,
        slot: SlotId,
        peer: SocketAddr,
        first_receive: Serial,
        now: Ticks,
        pool: &mut impl PacketPool,
    ) {
        log::info!("[conn {slot}] fresh client {peer}");
        self.flush_queues(pool);

        let step = self.config.step;
        self.slot = Some(slot);
        self.peer = Some(peer);
        self.serial = Serial::ZERO;
        self.receive_serial = first_receive;
        self.max_valid = Serial::ZERO.retreat(step);
        self.rtt.reset();
        self.kind = 0;
        self.killed = false;

        self.valid_time = now;
        self.next_write_time = now + self.config.ack_retransmit_base;
        self.next_ack_time = now + self.config.ack_retransmit_base;
        self.ack_pending = true;
    }

    /// Release the slot and every queued buffer.
    pub fn close(&mut self, pool: &mut impl PacketPool) {
        if let (Some(slot), Some(peer)) = (self.slot, self.peer) {
            log::info!("[conn {slot}] closed {peer}");
        }
        self.routing_mask = 0;
        self.slot = None;
        self.peer = None;
        self.ack_pending = false;
        self.killed = false;
        self.flush_queues(pool);
    }

    /// Return every queued envelope to the pool and forget selective state.
    pub fn flush_queues(&mut self, pool: &mut impl PacketPool) {
        self.selective = None;
        for kind in QueueKind::ALL {
            for envelope in self.queues.drain(kind) {
                pool.release(envelope.payload);
            }
        }
    }

    /// Mark the connection dead and tell the rest of the table.
    ///
    /// Idempotent: only the first call notifies.
    pub fn kill(&mut self, host: &mut impl Host) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.routing_mask = 0;

        let local = host.local_slot();
        let message = if self.slot == Some(SERVER_SLOT) {
            // Lost the server: log ourselves out locally.
            ControlMessage {
                distribution: slot_bit(local),
                command: ControlCommand::Logout,
                sender: local,
            }
        } else {
            ControlMessage {
                distribution: SERVER_ONLY,
                command: ControlCommand::Logout,
                sender: self.slot.unwrap_or(local),
            }
        };
        host.send_control(message);
    }

    // -----------------------------------------------------------------------
    // Send side
    // -----------------------------------------------------------------------

    /// Queue a copy of `payload` for delivery to `distribution`.
    ///
    /// Payloads larger than one frame are refused; the connection stays up.
    pub fn submit(
        &mut self,
        payload: &Payload,
        distribution: u16,
        host: &mut impl Host,
    ) -> Result<(), ConnError> {
        if self.peer.is_none() {
            return Err(ConnError::Unassigned);
        }
        if payload.data.len() > datagram::MAX_DATA_LEN {
            return Err(ConnError::PayloadTooLarge {
                len: payload.data.len(),
                limit: datagram::MAX_DATA_LEN,
            });
        }
        match host.duplicate(payload) {
            Some(mut copy) => {
                copy.distribution = distribution;
                self.queues
                    .push_back(QueueKind::Pending, Envelope::unsequenced(copy));
                Ok(())
            }
            None => {
                log::warn!("[conn {}] payload duplication failed", self.label());
                self.kill(host);
                Err(ConnError::PoolExhausted)
            }
        }
    }

    /// Submit the part of `payload.distribution` this connection serves.
    ///
    /// The served bits (this slot plus the routing mask) are cleared from
    /// `payload` so later connections do not forward them again.
    pub fn route(&mut self, payload: &mut Payload, host: &mut impl Host) -> Result<(), ConnError> {
        let slot = self.slot.ok_or(ConnError::Unassigned)?;
        let extended = self.routing_mask | slot_bit(slot);
        self.submit(payload, payload.distribution & extended, host)?;
        payload.distribution &= !extended;
        Ok(())
    }

    /// Sequence every pending envelope and move it to *in-flight*.
    pub fn promote(&mut self, now: Ticks) {
        while let Some(id) = self.queues.front(QueueKind::Pending) {
            if let Some(envelope) = self.queues.get_mut(id) {
                envelope.serial = self.serial;
                envelope.birth = now;
                envelope.next_send = now;
            }
            self.serial = self.serial.advance(self.config.step);
            self.queues.move_to_back(id, QueueKind::InFlight);
        }
    }

    /// Pick the in-flight envelope to (re)transmit now, if any.
    ///
    /// The chosen envelope is rescheduled one retransmit timeout ahead and
    /// moved to the tail of *in-flight*; it is only removed once
    /// acknowledged.  An envelope the peer has already acknowledged is
    /// retired here instead of being sent.
    ///
    /// Kills the connection when the peer has been silent for the liveness
    /// timeout or the transmit queue has overflowed.
    pub fn select_next(
        &mut self,
        now: Ticks,
        pace_interval: Ticks,
        urgency_bonus: Ticks,
        host: &mut impl Host,
    ) -> Result<Option<EnvelopeId>, ConnError> {
        let window = self.config.step * self.config.receive_window;
        let mut queued = 0usize;
        let mut oldest_birth = now;
        let mut best: Option<(EnvelopeId, Ticks, Serial)> = None;

        for (id, envelope) in self.queues.iter(QueueKind::InFlight) {
            // Counted whether or not it is a candidate.
            queued += 1;
            if envelope.serial.diff(self.max_valid) > window {
                continue;
            }
            if envelope.has_been_sent() && envelope.birth < oldest_birth {
                oldest_birth = envelope.birth;
            }
            let send_time = envelope.effective_send_time(urgency_bonus);
            match best {
                Some((_, best_time, _)) if best_time <= send_time => {}
                _ => best = Some((id, send_time, envelope.serial)),
            }
        }

        let liveness = self.config.liveness_timeout;
        if now - oldest_birth > liveness && now - self.valid_time > liveness {
            log::warn!(
                "[conn {}] oldest envelope born {} ticks ago, no ack for {}",
                self.label(),
                now - oldest_birth,
                now - self.valid_time
            );
            self.kill(host);
            return Err(ConnError::PeerTimedOut {
                silent_for: now - self.valid_time,
            });
        }

        if queued > self.config.max_transmit_queue {
            log::warn!("[conn {}] transmit queue overflow ({queued})", self.label());
            self.kill(host);
            return Err(ConnError::TransmitOverflow {
                queued,
                limit: self.config.max_transmit_queue,
            });
        }

        let Some((id, send_time, serial)) = best else {
            return Ok(None);
        };

        if !serial.is_ahead_of(self.max_valid) {
            self.validate(id, now, host);
            return Ok(None);
        }

        if send_time - pace_interval > now {
            return Ok(None);
        }

        let retransmit = self.rtt.retransmit_time();
        if let Some(envelope) = self.queues.get_mut(id) {
            envelope.next_send = now + retransmit;
        }
        self.queues.move_to_back(id, QueueKind::InFlight);
        Ok(Some(id))
    }

    /// One tick of the send side: promote, select, or fall back to an
    /// ack-only datagram when an acknowledgment is due.
    pub fn next_outgoing(
        &mut self,
        now: Ticks,
        pace_interval: Ticks,
        urgency_bonus: Ticks,
        host: &mut impl Host,
    ) -> Result<Outgoing, ConnError> {
        let mut chosen = None;
        if self.peer.is_some() {
            self.promote(now);
            chosen = self.select_next(now, pace_interval, urgency_bonus, host)?;
        }

        let outgoing = match chosen {
            Some(id) => Outgoing::Envelope(id),
            None if self.ack_pending && self.next_ack_time <= now => Outgoing::AckOnly,
            None => Outgoing::Nothing,
        };

        if outgoing != Outgoing::Nothing {
            let retransmit = self.rtt.retransmit_time();
            self.ack_pending = false;
            self.next_ack_time = now + self.config.ack_retransmit_base + retransmit;
            self.next_write_time = now + retransmit;
            match outgoing {
                Outgoing::Envelope(id) => {
                    if let Some(envelope) = self.queues.get(id) {
                        log::debug!("[conn {}] → serial={}", self.label(), envelope.serial);
                    }
                }
                _ => log::debug!("[conn {}] → ACK", self.label()),
            }
        }
        Ok(outgoing)
    }

    /// Encode the datagram for `outgoing` into `buf`.
    ///
    /// Returns `false` (leaving `buf` untouched) when there is nothing to
    /// send.
    pub fn encode_outgoing(&self, outgoing: Outgoing, buf: &mut Vec<u8>) -> bool {
        match outgoing {
            Outgoing::Nothing => false,
            Outgoing::AckOnly => {
                self.write_acks(buf);
                datagram::seal(buf);
                true
            }
            Outgoing::Envelope(id) => {
                let Some(envelope) = self.queues.get(id) else {
                    return false;
                };
                self.write_acks(buf);
                datagram::encode_frame(envelope.serial, &envelope.payload, buf);
                datagram::seal(buf);
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Acknowledgments
    // -----------------------------------------------------------------------

    /// Append the ack header describing what we have received.
    pub fn write_acks(&self, buf: &mut Vec<u8>) -> usize {
        let header = self.ack_header();
        header.encode(buf);
        header.encoded_len()
    }

    /// The ack header [`Connection::write_acks`] would emit.
    pub fn ack_header(&self) -> AckHeader {
        match self.selective {
            Some(sack) => AckHeader::Selective(sack),
            None => AckHeader::Cumulative(self.receive_serial.retreat(self.config.step)),
        }
    }

    /// Consume the ack header at the front of `buf`, retiring every
    /// envelope it acknowledges.  Returns the header length.
    pub fn validate_packets(
        &mut self,
        buf: &[u8],
        now: Ticks,
        host: &mut impl Host,
    ) -> Result<usize, DecodeError> {
        let (header, used) = AckHeader::decode(buf, self.max_valid)?;
        self.apply_ack(header, now, host);
        Ok(used)
    }

    /// Process a decoded ack header.
    pub fn apply_ack(&mut self, header: AckHeader, now: Ticks, host: &mut impl Host) {
        let step = self.config.step;
        if let AckHeader::Selective(_) = header {
            for id in self.queues.ids(QueueKind::InFlight) {
                let hit = self
                    .queues
                    .get(id)
                    .is_some_and(|e| header.selectively_acks(e.serial, step));
                if hit {
                    self.validate(id, now, host);
                }
            }
        }

        self.valid_time = now;

        // Only serials we have actually assigned can be acknowledged.
        let cumulative = header.cumulative();
        if cumulative.is_ahead_of(self.max_valid) && self.serial.is_ahead_of(cumulative) {
            self.max_valid = cumulative;
            self.run_validate(host);
        }
    }

    /// Retire `id` from *in-flight*, sampling its round trip.
    ///
    /// Returns `false` when the envelope was already retired.
    pub fn validate(&mut self, id: EnvelopeId, when: Ticks, host: &mut impl Host) -> bool {
        let Some(envelope) = self.queues.remove(QueueKind::InFlight, id) else {
            return false;
        };
        self.rtt
            .record_sample(when - envelope.birth, host.urgent_resend_floor());
        log::trace!(
            "[conn {}] validated serial={} rto={}",
            self.label(),
            envelope.serial,
            self.rtt.retransmit_time()
        );
        host.release(envelope.payload);
        true
    }

    /// Retire every in-flight envelope at or below the high-water ack.
    fn run_validate(&mut self, host: &mut impl Host) {
        let when = self.valid_time;
        for id in self.queues.ids(QueueKind::InFlight) {
            let acked = self
                .queues
                .get(id)
                .is_some_and(|e| e.serial.is_at_or_behind(self.max_valid));
            if acked {
                self.validate(id, when, host);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Receive side
    // -----------------------------------------------------------------------

    /// Process a datagram body (checksum already stripped).
    pub fn handle_datagram(
        &mut self,
        body: &[u8],
        now: Ticks,
        host: &mut impl Host,
    ) -> Result<(), DecodeError> {
        let used = self.validate_packets(body, now, host)?;
        if let Some((serial, payload)) = datagram::decode_frame(&body[used..], self.receive_serial)? {
            if !host.adopt(&payload) {
                log::debug!("[conn {}] pool full, dropping serial={serial}", self.label());
                return Ok(());
            }
            self.on_receive(Envelope::received(serial, payload), host);
        }
        Ok(())
    }

    /// Accept one sequenced envelope from the peer.
    ///
    /// In-order envelopes are delivered immediately together with anything
    /// they unblock from *reorder*; later ones are held; earlier ones and
    /// duplicates are released.
    pub fn on_receive(&mut self, envelope: Envelope, host: &mut impl Host) {
        let step = self.config.step;
        let serial = envelope.serial;
        let expected_before = self.receive_serial;
        let mut reorder_changed = false;

        self.ack_pending = true;

        if serial.diff(self.receive_serial) < 0 {
            log::trace!("[conn {}] ← duplicate serial={serial}", self.label());
            host.release(envelope.payload);
        } else if serial == self.receive_serial {
            self.receive_serial = serial.advance(step);
            host.deliver(self.slot, envelope.payload);

            while let Some(id) = self.first_deliverable() {
                let Some(held) = self.queues.remove(QueueKind::Reorder, id) else {
                    break;
                };
                reorder_changed = true;
                if held.serial == self.receive_serial {
                    self.receive_serial = held.serial.advance(step);
                    host.deliver(self.slot, held.payload);
                } else {
                    host.release(held.payload);
                }
            }
        } else if self.queues.iter(QueueKind::Reorder).any(|(_, e)| e.serial == serial) {
            log::trace!("[conn {}] ← already held serial={serial}", self.label());
            host.release(envelope.payload);
        } else {
            log::trace!("[conn {}] ← holding serial={serial}", self.label());
            self.queues.push_back(QueueKind::Reorder, envelope);
            reorder_changed = true;
        }

        if reorder_changed || self.receive_serial != expected_before {
            self.rebuild_selective();
        }

        if log::log_enabled!(log::Level::Trace) {
            let held: Vec<i32> = self
                .queues
                .iter(QueueKind::Reorder)
                .map(|(_, e)| e.serial.0)
                .collect();
            log::trace!(
                "[conn {}] expecting {} holding {:?}",
                self.label(),
                self.receive_serial,
                held
            );
        }
    }

    /// First held envelope at or below the expected serial.
    fn first_deliverable(&self) -> Option<EnvelopeId> {
        self.queues
            .iter(QueueKind::Reorder)
            .find(|(_, e)| e.serial.is_at_or_behind(self.receive_serial))
            .map(|(id, _)| id)
    }

    fn rebuild_selective(&mut self) {
        let step = self.config.step;
        let base = self.receive_serial.retreat(step);
        self.selective = SelectiveAck::from_held(
            base,
            self.queues.iter(QueueKind::Reorder).map(|(_, e)| e.serial),
            step,
        );
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.peer.is_some()
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn next_serial(&self) -> Serial {
        self.serial
    }

    pub fn max_valid(&self) -> Serial {
        self.max_valid
    }

    pub fn receive_serial(&self) -> Serial {
        self.receive_serial
    }

    pub fn queue_len(&self, kind: QueueKind) -> usize {
        self.queues.len(kind)
    }

    /// Serials held in `kind`, head to tail.
    pub fn serials(&self, kind: QueueKind) -> Vec<Serial> {
        self.queues.iter(kind).map(|(_, e)| e.serial).collect()
    }

    pub fn envelope(&self, id: EnvelopeId) -> Option<&Envelope> {
        self.queues.get(id)
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn last_ack_time(&self) -> Ticks {
        self.valid_time
    }

    /// `true` once the retransmit interval since the last write has passed.
    pub fn is_write_due(&self, now: Ticks) -> bool {
        self.next_write_time <= now
    }

    pub fn routing_mask(&self) -> u16 {
        self.routing_mask
    }

    pub fn set_routing_mask(&mut self, mask: u16) {
        self.routing_mask = mask;
    }

    pub fn kind(&self) -> i16 {
        self.kind
    }

    pub fn set_kind(&mut self, kind: i16) {
        self.kind = kind;
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        let peer = self.peer?;
        Some(ConnectionStatus {
            peer,
            estimated_round_trip: ticks_to_millis(self.rtt.real_round_trip()),
            average_round_trip: ticks_to_millis(self.rtt.round_trip()),
            pessimist_round_trip: ticks_to_millis(self.rtt.pessimist()),
            optimist_round_trip: ticks_to_millis(self.rtt.optimist()),
            kind: self.kind,
        })
    }

    fn label(&self) -> String {
        match self.slot {
            Some(slot) => slot.to_string(),
            None => "-".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
