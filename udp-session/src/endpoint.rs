//! Async driver: one socket, one connection table, one task.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send / close / status            EndpointHandle
//!      │                               ┌──────────────────────┐
//!      └──────────────────────────────▶│  command_tx (mpsc)   │
//!      ◀───────────────────────────────│  event_rx   (mpsc)   │
//!                                      └──────────┬───────────┘
//!                                                 │ event_loop task
//!  ConnectionTable + MemoryHost + Clock ◀─────────┤  select! over
//!                                                 │   tick / socket / command
//!  Socket (tokio UdpSocket) ◀─────────────────────┘
//! ```
//!
//! The engine state never leaves the event-loop task, so nothing is shared
//! and nothing is locked.  Every tick the table is polled once and whatever
//! it produces is written to the socket.
//!
//! Events are pushed into a bounded channel of [`CHANNEL_DEPTH`] entries
//! with an awaiting send.  An application that stops reading events stalls
//! the whole loop until it reads again; delivered payloads are never dropped
//! to make room.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EndpointConfig;
use crate::connection::ConnectionStatus;
use crate::envelope::Payload;
use crate::error::EndpointError;
use crate::datagram;
use crate::host::{is_addressable, ControlMessage, ControlPacket, Delivery, MemoryHost, SlotId};
use crate::socket::{Socket, MAX_DATAGRAM};
use crate::table::ConnectionTable;
use crate::time::Clock;

/// Capacity of the command and event channels.
pub const CHANNEL_DEPTH: usize = 256;

/// Requests accepted by the event loop.
#[derive(Debug)]
pub enum Command {
    /// Route a payload to every slot in its distribution.
    Send(Payload),
    /// Bind `peer` to `slot`.
    Connect { slot: SlotId, peer: SocketAddr },
    /// Reconcile the client slots with a desired-peer table (entry `i` is
    /// slot `i + 1`).
    SyncPeers(Vec<Option<SocketAddr>>),
    Close(SlotId),
    Control(ControlPacket),
    SetRoutingMask { slot: SlotId, mask: u16 },
    Status {
        slot: SlotId,
        reply: oneshot::Sender<Option<ConnectionStatus>>,
    },
    /// Reply `true` once no connection holds out-of-order data.
    Quiescent(oneshot::Sender<bool>),
}

/// Notifications produced by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Delivered(Delivery),
    Opened { slot: SlotId, peer: SocketAddr },
    Closed { slot: SlotId },
    Control(ControlMessage),
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A bound endpoint that has not started its event loop yet.
pub struct Endpoint {
    socket: Socket,
    driver: Driver,
}

impl Endpoint {
    pub async fn bind(config: EndpointConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        let socket = Socket::bind(config.bind).await?;
        log::info!("[endpoint] bound {}", socket.local_addr);
        Ok(Self {
            socket,
            driver: Driver::new(config),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Bind `peer` to `slot` before the event loop starts.
    pub fn connect(&mut self, slot: SlotId, peer: SocketAddr) -> Result<(), EndpointError> {
        self.driver.connect(slot, peer)
    }

    /// Spawn the event loop and return a handle to it.
    ///
    /// Dropping the handle's `command_tx` (or calling
    /// [`EndpointHandle::shutdown`]) stops the loop.
    pub fn run(self) -> EndpointHandle {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
        let local_addr = self.socket.local_addr;
        let handle = tokio::spawn(event_loop(self.socket, self.driver, command_rx, event_tx));
        EndpointHandle {
            command_tx,
            event_rx,
            local_addr,
            handle,
        }
    }
}

// ---------------------------------------------------------------------------
// EndpointHandle: concurrent handle
// ---------------------------------------------------------------------------

pub struct EndpointHandle {
    pub command_tx: mpsc::Sender<Command>,
    pub event_rx: mpsc::Receiver<Event>,
    pub local_addr: SocketAddr,
    handle: JoinHandle<Result<(), EndpointError>>,
}

impl EndpointHandle {
    async fn command(&self, command: Command) -> Result<(), EndpointError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Queue `payload` for every slot in `payload.distribution`.
    pub async fn send(&self, payload: Payload) -> Result<(), EndpointError> {
        self.command(Command::Send(payload)).await
    }

    pub async fn connect(&self, slot: SlotId, peer: SocketAddr) -> Result<(), EndpointError> {
        self.command(Command::Connect { slot, peer }).await
    }

    pub async fn close_slot(&self, slot: SlotId) -> Result<(), EndpointError> {
        self.command(Command::Close(slot)).await
    }

    pub async fn status(&self, slot: SlotId) -> Result<Option<ConnectionStatus>, EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status { slot, reply }).await?;
        rx.await.map_err(|_| EndpointError::Closed)
    }

    pub async fn is_quiescent(&self) -> Result<bool, EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Quiescent(reply)).await?;
        rx.await.map_err(|_| EndpointError::Closed)
    }

    /// Next event; `None` once the loop has stopped.
    ///
    /// The loop waits while the event channel is full, so call this
    /// regularly.
    pub async fn recv(&mut self) -> Option<Event> {
        self.event_rx.recv().await
    }

    /// Stop the event loop and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), EndpointError> {
        drop(self.command_tx);
        self.handle.await.map_err(|_| EndpointError::Closed)?
    }
}

// ---------------------------------------------------------------------------
// Driver: synchronous engine state owned by the loop
// ---------------------------------------------------------------------------

struct Driver {
    config: EndpointConfig,
    table: ConnectionTable,
    host: MemoryHost,
    clock: Clock,
    events: Vec<Event>,
}

impl Driver {
    fn new(config: EndpointConfig) -> Self {
        let table = ConnectionTable::new(config.slots, config.engine.clone());
        let host = MemoryHost::new(
            config.local_slot,
            config.urgent_resend_floor,
            config.pool_capacity,
        );
        Self {
            config,
            table,
            host,
            clock: Clock::new(),
            events: Vec::new(),
        }
    }

    fn connect(&mut self, slot: SlotId, peer: SocketAddr) -> Result<(), EndpointError> {
        if !is_addressable(slot) {
            return Err(EndpointError::InvalidSlot(slot));
        }
        let now = self.clock.now();
        if !self.table.open_slot(slot, peer, now, &mut self.host) {
            return Err(EndpointError::TableFull);
        }
        self.events.push(Event::Opened { slot, peer });
        Ok(())
    }

    fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) {
        let now = self.clock.now();
        // Only a datagram that passes its checksum may claim a slot.
        if self.config.accept_unknown
            && self.table.find_by_addr(from).is_none()
            && datagram::open(bytes).is_ok()
        {
            match self.table.accept(from, now, &mut self.host) {
                Some(slot) => self.events.push(Event::Opened { slot, peer: from }),
                None => log::warn!("[endpoint] no free slot for {from}"),
            }
        }
        if let Err(e) = self.table.handle_datagram(from, bytes, now, &mut self.host) {
            log::debug!("[endpoint] ← {from}: {e}");
        }
    }

    fn on_tick(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let now = self.clock.now();
        self.table.poll_transmit(now, &mut self.host)
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Send(mut payload) => {
                payload.sender = self.config.local_slot;
                let routed = self.table.route_packet(&mut payload, &mut self.host);
                if payload.distribution != 0 {
                    log::debug!(
                        "[endpoint] no route for distribution {:#06x} ({routed} routed)",
                        payload.distribution
                    );
                }
            }
            Command::Connect { slot, peer } => {
                if let Err(e) = self.connect(slot, peer) {
                    log::warn!("[endpoint] connect {peer} as slot {slot}: {e}");
                }
            }
            Command::SyncPeers(mut desired) => {
                let now = self.clock.now();
                self.table.mark_open_connections(&mut desired, &mut self.host);
                let wanted = desired.clone();
                self.table
                    .open_new_connections(&mut desired, now, &mut self.host);
                for (i, (want, left)) in wanted.iter().zip(&desired).enumerate() {
                    match (want, left) {
                        (Some(peer), None) => self.events.push(Event::Opened {
                            slot: (i + 1) as SlotId,
                            peer: *peer,
                        }),
                        (Some(peer), Some(_)) => {
                            log::warn!("[endpoint] no free record for {peer}")
                        }
                        _ => {}
                    }
                }
            }
            Command::Close(slot) => {
                if self.table.close_slot(slot, &mut self.host) {
                    self.events.push(Event::Closed { slot });
                }
            }
            Command::Control(packet) => {
                self.table.receive_control(packet);
            }
            Command::SetRoutingMask { slot, mask } => {
                self.table.set_routing_mask(slot, mask);
            }
            Command::Status { slot, reply } => {
                let _ = reply.send(self.table.status(slot));
            }
            Command::Quiescent(reply) => {
                let _ = reply.send(self.table.is_quiescent());
            }
        }
    }

    /// Collect everything the engine produced since the last call.
    fn drain_events(&mut self) -> Vec<Event> {
        let mut events = std::mem::take(&mut self.events);
        events.extend(self.host.take_deliveries().into_iter().map(Event::Delivered));
        for message in self.host.take_controls() {
            log::info!(
                "[endpoint] logout for slot {} (to {:#06x})",
                message.sender,
                message.distribution
            );
            events.push(Event::Control(message));
        }
        for slot in self.table.reap_killed(&mut self.host) {
            events.push(Event::Closed { slot });
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

async fn event_loop(
    socket: Socket,
    mut driver: Driver,
    mut command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<Event>,
) -> Result<(), EndpointError> {
    let mut ticker = tokio::time::interval(driver.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            // ── Branch 1: send tick ──────────────────────────────────────
            _ = ticker.tick() => {
                for (peer, datagram) in driver.on_tick() {
                    if let Err(e) = socket.send_to(&datagram, peer).await {
                        log::warn!("[endpoint] → {peer}: {e}");
                    }
                }
            }

            // ── Branch 2: incoming datagram ──────────────────────────────
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((bytes, from)) => driver.on_datagram(from, bytes),
                    // ICMP unreachable and similar arrive as recv errors.
                    Err(e) => log::debug!("[endpoint] recv: {e}"),
                }
            }

            // ── Branch 3: application command ────────────────────────────
            command = command_rx.recv() => {
                match command {
                    Some(command) => driver.apply(command),
                    None => {
                        log::info!("[endpoint] handle dropped, stopping");
                        break;
                    }
                }
            }
        }

        // Waits for the application when the event channel is full.
        for event in driver.drain_events() {
            if event_tx.send(event).await.is_err() {
                // Nobody is listening; keep serving until told to stop.
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::slot_bit;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn sync_peers_reports_opened_slots() {
        let mut driver = Driver::new(EndpointConfig::default());
        driver.apply(Command::SyncPeers(vec![None, Some(addr(5))]));
        assert_eq!(
            driver.drain_events(),
            vec![Event::Opened {
                slot: 2,
                peer: addr(5)
            }]
        );
        assert!(driver.table.status(2).is_some());
    }

    #[test]
    fn send_stamps_local_slot() {
        let mut driver = Driver::new(EndpointConfig {
            local_slot: 3,
            ..EndpointConfig::default()
        });
        driver.connect(0, addr(9)).unwrap();
        let mut payload = Payload::new(1, b"x".to_vec());
        payload.distribution = slot_bit(0);
        driver.apply(Command::Send(payload));

        let out = driver.on_tick();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, addr(9));

        let body = crate::datagram::open(&out[0].1).unwrap();
        let frame = &body[crate::ack::CUMULATIVE_LEN..];
        let (_, sent) = crate::datagram::decode_frame(frame, crate::seq::Serial::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(sent.sender, 3);
        assert_eq!(sent.data, b"x".to_vec());
    }

    #[test]
    fn connect_rejects_unaddressable_slot() {
        let mut driver = Driver::new(EndpointConfig {
            slots: 16,
            ..EndpointConfig::default()
        });
        assert!(matches!(
            driver.connect(16, addr(7)),
            Err(EndpointError::InvalidSlot(16))
        ));
        assert!(driver.drain_events().is_empty());
        assert_eq!(driver.table.active_count(), 0);
    }

    #[test]
    fn noise_from_unknown_address_claims_no_slot() {
        let mut driver = Driver::new(EndpointConfig {
            accept_unknown: true,
            ..EndpointConfig::default()
        });
        driver.on_datagram(addr(50), &[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]);
        driver.on_datagram(addr(51), &[0x00]);
        assert!(driver.drain_events().is_empty());
        assert_eq!(driver.table.active_count(), 0);

        let mut ack = Vec::new();
        crate::ack::AckHeader::Cumulative(crate::seq::Serial(-2)).encode(&mut ack);
        crate::datagram::seal(&mut ack);
        driver.on_datagram(addr(52), &ack);
        assert_eq!(
            driver.drain_events(),
            vec![Event::Opened {
                slot: 1,
                peer: addr(52)
            }]
        );
    }

    #[test]
    fn close_emits_event() {
        let mut driver = Driver::new(EndpointConfig::default());
        driver.connect(1, addr(7)).unwrap();
        driver.drain_events();
        driver.apply(Command::Close(1));
        assert_eq!(driver.drain_events(), vec![Event::Closed { slot: 1 }]);
    }
}
