//! Fault-injecting network simulator for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] wraps any [`DatagramPort`] and intercepts *outbound*
//! datagrams, applying a configurable fault model:
//!
//! | Fault       | Control                                                  |
//! |-------------|----------------------------------------------------------|
//! | Loss        | `loss_rate` probability, or a [`drop_where`] predicate   |
//! |             | over the decoded header for surgical drops.              |
//! | Reordering  | `reorder_rate` probability, or [`hold_next_data`]: park  |
//! |             | one data datagram and release it after the next send, so |
//! |             | exactly one later packet overtakes it.                   |
//! | Duplication | `duplicate_rate` probability: the datagram is sent twice.|
//!
//! Probabilistic faults draw from a seeded RNG so failing runs reproduce.
//! Counters record every injected fault for test assertions.
//!
//! [`drop_where`]: Simulator::drop_where
//! [`hold_next_data`]: Simulator::hold_next_data

use std::io;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Header, Packet};
use crate::socket::DatagramPort;

/// Configuration for the fault-injection model.
///
/// All rates are probabilities in `[0.0, 1.0]`.  The default is a
/// transparent pass-through.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given outbound datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is held back and overtaken by the next one.
    pub reorder_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Seed for the fault RNG; fix it to make a failing test reproducible.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

/// Counts of injected faults since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub dropped: u64,
    pub reordered: u64,
    pub duplicated: u64,
}

type DropFilter = Box<dyn FnMut(&Header) -> bool + Send>;

/// A fault-injecting wrapper around a datagram port.
pub struct Simulator<P: DatagramPort> {
    inner: P,
    pub config: SimulatorConfig,
    pub stats: SimStats,
    rng: StdRng,
    /// Datagram parked by a reorder fault, released after the next send.
    held: Option<(Vec<u8>, SocketAddr)>,
    /// One-shot flag driving [`Simulator::hold_next_data`].
    hold_next_data: bool,
    drop_filter: Option<DropFilter>,
}

impl<P: DatagramPort> Simulator<P> {
    pub fn new(inner: P, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            stats: SimStats::default(),
            rng,
            held: None,
            hold_next_data: false,
            drop_filter: None,
        }
    }

    /// Swap in a new fault model mid-test, reseeding the RNG from it.
    ///
    /// Useful for keeping the handshake fault-free and injecting faults only
    /// once the connection is established.
    pub fn set_config(&mut self, config: SimulatorConfig) {
        self.rng = StdRng::seed_from_u64(config.seed);
        self.config = config;
    }

    /// Drop every outbound datagram for which `f` returns `true`.
    ///
    /// The predicate sees the decoded header and may carry its own state,
    /// e.g. "drop only the first data segment I see".
    pub fn drop_where(&mut self, f: impl FnMut(&Header) -> bool + Send + 'static) {
        self.drop_filter = Some(Box::new(f));
    }

    /// Remove any installed drop predicate.
    pub fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    /// Park the next payload-carrying datagram and deliver it right after
    /// the following send, producing exactly one overtake.
    pub fn hold_next_data(&mut self) {
        self.hold_next_data = true;
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }
}

impl<P: DatagramPort> DatagramPort for Simulator<P> {
    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        // Our own encoder produced `buf`, so decoding only fails for foreign
        // traffic, which the fault model passes through untouched.
        let header = Packet::decode(buf).ok().map(|p| p.header);

        if let (Some(h), Some(filter)) = (header.as_ref(), self.drop_filter.as_mut()) {
            if filter(h) {
                self.stats.dropped += 1;
                log::debug!("[sim] dropping seq={} len={} (filter)", h.seq, h.length);
                return Ok(buf.len());
            }
        }
        if self.roll(self.config.loss_rate) {
            self.stats.dropped += 1;
            log::trace!("[sim] dropping datagram (loss rate)");
            return Ok(buf.len());
        }

        let is_data = header.as_ref().map_or(false, |h| h.length > 0);
        let hold = (self.hold_next_data && is_data) || self.roll(self.config.reorder_rate);
        if hold && self.held.is_none() {
            if self.hold_next_data && is_data {
                self.hold_next_data = false;
            }
            self.held = Some((buf.to_vec(), dst));
            log::debug!("[sim] holding datagram for reorder");
            return Ok(buf.len());
        }

        let n = self.inner.send_to(buf, dst)?;
        if let Some((parked, parked_dst)) = self.held.take() {
            self.inner.send_to(&parked, parked_dst)?;
            self.stats.reordered += 1;
            log::debug!("[sim] released held datagram after overtake");
        }
        if self.roll(self.config.duplicate_rate) {
            self.inner.send_to(buf, dst)?;
            self.stats.duplicated += 1;
            log::trace!("[sim] duplicated datagram");
        }
        Ok(n)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;
    use std::collections::VecDeque;

    /// In-memory port recording everything "sent" through it.
    #[derive(Default)]
    struct RecordingPort {
        sent: VecDeque<Vec<u8>>,
    }

    impl DatagramPort for RecordingPort {
        fn send_to(&mut self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
            self.sent.push_back(buf.to_vec());
            Ok(buf.len())
        }

        fn recv_from(&mut self, _buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn dst() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn datagram(seq: u32, payload: &[u8]) -> Vec<u8> {
        Packet::new(seq, 0, flags::ACK, 1024, payload.to_vec()).encode()
    }

    #[test]
    fn pass_through_by_default() {
        let mut sim = Simulator::new(RecordingPort::default(), SimulatorConfig::default());
        sim.send_to(&datagram(1, b"a"), dst()).unwrap();
        sim.send_to(&datagram(2, b"b"), dst()).unwrap();
        assert_eq!(sim.inner.sent.len(), 2);
        assert_eq!(sim.stats, SimStats::default());
    }

    #[test]
    fn full_loss_drops_everything() {
        let config = SimulatorConfig {
            loss_rate: 1.0,
            ..Default::default()
        };
        let mut sim = Simulator::new(RecordingPort::default(), config);
        sim.send_to(&datagram(1, b"a"), dst()).unwrap();
        assert!(sim.inner.sent.is_empty());
        assert_eq!(sim.stats.dropped, 1);
    }

    #[test]
    fn drop_filter_targets_specific_segments() {
        let mut sim = Simulator::new(RecordingPort::default(), SimulatorConfig::default());
        let mut armed = true;
        sim.drop_where(move |h| {
            if armed && h.length > 0 {
                armed = false;
                true
            } else {
                false
            }
        });

        sim.send_to(&datagram(10, b"first data"), dst()).unwrap(); // dropped
        sim.send_to(&datagram(10, b"first data"), dst()).unwrap(); // retransmit passes
        sim.send_to(&datagram(0, b""), dst()).unwrap(); // pure ACK passes

        assert_eq!(sim.stats.dropped, 1);
        assert_eq!(sim.inner.sent.len(), 2);
    }

    #[test]
    fn hold_next_data_swaps_two_datagrams() {
        let mut sim = Simulator::new(RecordingPort::default(), SimulatorConfig::default());
        sim.hold_next_data();

        sim.send_to(&datagram(0, b""), dst()).unwrap(); // control: unaffected
        sim.send_to(&datagram(100, b"AAAA"), dst()).unwrap(); // parked
        sim.send_to(&datagram(104, b"BBBB"), dst()).unwrap(); // overtakes

        let order: Vec<u32> = sim
            .inner
            .sent
            .iter()
            .map(|b| Packet::decode(b).unwrap().header.seq)
            .collect();
        assert_eq!(order, vec![0, 104, 100]);
        assert_eq!(sim.stats.reordered, 1);
    }

    #[test]
    fn duplication_sends_twice() {
        let config = SimulatorConfig {
            duplicate_rate: 1.0,
            ..Default::default()
        };
        let mut sim = Simulator::new(RecordingPort::default(), config);
        sim.send_to(&datagram(5, b"x"), dst()).unwrap();
        assert_eq!(sim.inner.sent.len(), 2);
        assert_eq!(sim.stats.duplicated, 1);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let config = SimulatorConfig {
            loss_rate: 0.5,
            seed: 99,
            ..Default::default()
        };
        let outcomes = |mut sim: Simulator<RecordingPort>| -> Vec<usize> {
            (0..32)
                .map(|i| {
                    sim.send_to(&datagram(i, b"p"), dst()).unwrap();
                    sim.inner.sent.len()
                })
                .collect()
        };

        let a = outcomes(Simulator::new(RecordingPort::default(), config.clone()));
        let b = outcomes(Simulator::new(RecordingPort::default(), config));
        assert_eq!(a, b);
    }
}
