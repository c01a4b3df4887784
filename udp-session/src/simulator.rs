//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate datagrams.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] carries raw datagrams between addresses on a virtual tick
//! clock and applies a seeded fault model:
//!
//! | Fault        | Description                                               |
//! |--------------|-----------------------------------------------------------|
//! | Loss         | Drop a datagram with probability `loss_rate`.             |
//! | Reordering   | Hold a datagram `reorder_delay` extra ticks so later ones |
//! |              | overtake it.                                              |
//! | Duplication  | Deliver a datagram twice.                                 |
//! | Corruption   | Flip one random bit; the checksum then rejects it.        |
//!
//! The same seed always yields the same fault sequence, so a failing run
//! can be replayed exactly.

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::time::Ticks;

/// Configuration for the fault-injection model.
///
/// All probabilities are clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub reorder_rate: f64,
    /// Extra delay applied to reordered datagrams.
    pub reorder_delay: Ticks,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    /// One-way delay applied to every datagram.
    pub latency: Ticks,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through with a small delay.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: 0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            latency: 5,
            seed: 0,
        }
    }
}

/// Counters describing what the fault model did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
    pub delivered: u64,
}

/// A datagram that has left the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct InTransit {
    deliver_at: Ticks,
    /// Submission order; breaks ties between equal delivery ticks.
    order: u64,
    arrival: Arrival,
}

/// A fault-injecting, tick-driven datagram carrier.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    in_transit: Vec<InTransit>,
    next_order: u64,
    stats: SimulatorStats,
}

impl Simulator {
    pub fn new(mut config: SimulatorConfig) -> Self {
        for rate in [
            &mut config.loss_rate,
            &mut config.reorder_rate,
            &mut config.duplicate_rate,
            &mut config.corrupt_rate,
        ] {
            *rate = rate.clamp(0.0, 1.0);
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            in_transit: Vec::new(),
            next_order: 0,
            stats: SimulatorStats::default(),
        }
    }

    /// A simulator that never injects faults.
    pub fn perfect() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Put a datagram on the wire at tick `now`.
    pub fn send(&mut self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>, now: Ticks) {
        self.stats.sent += 1;

        if self.rng.random_bool(self.config.loss_rate) {
            self.stats.dropped += 1;
            log::trace!("[sim] drop {from} → {to} ({} bytes)", bytes.len());
            return;
        }

        let copies = if self.rng.random_bool(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };

        for _ in 0..copies {
            let mut bytes = bytes.clone();
            let mut deliver_at = now + self.config.latency;

            if self.rng.random_bool(self.config.reorder_rate) {
                self.stats.reordered += 1;
                deliver_at += self.config.reorder_delay;
            }
            if !bytes.is_empty() && self.rng.random_bool(self.config.corrupt_rate) {
                self.stats.corrupted += 1;
                let bit = self.rng.random_range(0..bytes.len() * 8);
                bytes[bit / 8] ^= 1 << (bit % 8);
            }

            self.in_transit.push(InTransit {
                deliver_at,
                order: self.next_order,
                arrival: Arrival { from, to, bytes },
            });
            self.next_order += 1;
        }
    }

    /// Remove and return every datagram due at or before `now`, in delivery
    /// order.
    pub fn deliver_due(&mut self, now: Ticks) -> Vec<Arrival> {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_transit)
            .into_iter()
            .partition(|t| t.deliver_at <= now);
        self.in_transit = pending;

        due.sort_by_key(|t| (t.deliver_at, t.order));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|t| t.arrival).collect()
    }

    /// Datagrams still on the wire.
    pub fn in_flight(&self) -> usize {
        self.in_transit.len()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn perfect_network_delivers_in_order_after_latency() {
        let mut sim = Simulator::perfect();
        sim.send(addr(1), addr(2), vec![1], 0);
        sim.send(addr(1), addr(2), vec![2], 0);
        assert!(sim.deliver_due(4).is_empty());

        let got: Vec<Vec<u8>> = sim.deliver_due(5).into_iter().map(|a| a.bytes).collect();
        assert_eq!(got, vec![vec![1], vec![2]]);
        assert_eq!(sim.in_flight(), 0);
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut sim = Simulator::new(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        for i in 0..10 {
            sim.send(addr(1), addr(2), vec![i], 0);
        }
        assert!(sim.deliver_due(1_000).is_empty());
        assert_eq!(sim.stats().dropped, 10);
    }

    #[test]
    fn duplication_doubles_deliveries() {
        let mut sim = Simulator::new(SimulatorConfig {
            duplicate_rate: 1.0,
            ..SimulatorConfig::default()
        });
        sim.send(addr(1), addr(2), vec![7], 0);
        assert_eq!(sim.deliver_due(10).len(), 2);
    }

    #[test]
    fn reordered_datagram_is_overtaken() {
        let mut sim = Simulator::new(SimulatorConfig {
            reorder_rate: 1.0,
            reorder_delay: 20,
            ..SimulatorConfig::default()
        });
        sim.send(addr(1), addr(2), vec![1], 0);
        let mut sim_clean = sim;
        sim_clean.config.reorder_rate = 0.0;
        sim_clean.send(addr(1), addr(2), vec![2], 1);

        let first = sim_clean.deliver_due(10);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].bytes, vec![2]);
        assert_eq!(sim_clean.deliver_due(25)[0].bytes, vec![1]);
    }

    #[test]
    fn corruption_flips_exactly_one_bit() {
        let mut sim = Simulator::new(SimulatorConfig {
            corrupt_rate: 1.0,
            ..SimulatorConfig::default()
        });
        let original = vec![0u8; 16];
        sim.send(addr(1), addr(2), original.clone(), 0);
        let got = sim.deliver_due(10).remove(0).bytes;
        let flipped: u32 = got
            .iter()
            .zip(&original)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(flipped, 1);
    }

    #[test]
    fn same_seed_same_faults() {
        let cfg = SimulatorConfig {
            loss_rate: 0.5,
            seed: 42,
            ..SimulatorConfig::default()
        };
        let run = |cfg: &SimulatorConfig| {
            let mut sim = Simulator::new(cfg.clone());
            for i in 0..64u8 {
                sim.send(addr(1), addr(2), vec![i], 0);
            }
            sim.deliver_due(100)
                .into_iter()
                .map(|a| a.bytes[0])
                .collect::<Vec<_>>()
        };
        assert_eq!(run(&cfg), run(&cfg));
    }
}
