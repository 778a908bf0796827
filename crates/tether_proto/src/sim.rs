//! See [`Simulator`].

use {
    bytes::Bytes,
    rand::{Rng, SeedableRng, rngs::StdRng},
    std::{
        cmp::{Ordering, Reverse},
        collections::BinaryHeap,
        time::{Duration, Instant},
    },
};

/// Configuration for the outbound fault injector.
///
/// When enabled, every datagram the engine would put on the wire is either
/// dropped (with probability [`packet_loss_rate`]) or held back in a
/// time-sorted queue until `constant_delay + Uniform(0, random_delay)` has
/// passed. Only the local send path is affected; the peer sees the effect
/// as network loss and jitter.
///
/// [`packet_loss_rate`]: SimulatorConfig::packet_loss_rate
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Whether to route outgoing datagrams through the simulator at all.
    pub enabled: bool,
    /// Fixed delay added to every datagram.
    pub constant_delay: Duration,
    /// Upper bound of the uniformly random extra delay per datagram.
    pub random_delay: Duration,
    /// Probability in `[0, 1]` that a datagram is dropped outright.
    pub packet_loss_rate: f64,
    /// Seed for the loss/jitter draws, so a test run can be reproduced.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            constant_delay: Duration::ZERO,
            random_delay: Duration::ZERO,
            packet_loss_rate: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug)]
struct Delayed {
    release_at: Instant,
    seq: u64,
    datagram: Bytes,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        (self.release_at, self.seq) == (other.release_at, other.seq)
    }
}

impl Eq for Delayed {}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.release_at, self.seq).cmp(&(other.release_at, other.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deterministic local fault injector for the send path.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    queue: BinaryHeap<Reverse<Delayed>>,
    counter: u64,
}

impl Simulator {
    /// Creates a simulator from its configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            queue: BinaryHeap::new(),
            counter: 0,
        }
    }

    /// Submits a datagram the engine wants to send.
    ///
    /// The datagram is either dropped (the loss draw) or queued for release
    /// at its assigned time.
    pub fn offer(&mut self, now: Instant, datagram: Bytes) {
        if self.rng.gen_range(0.0..1.0) < self.config.packet_loss_rate {
            return;
        }
        let jitter = self.config.random_delay.mul_f64(self.rng.gen_range(0.0..1.0));
        let release_at = now + self.config.constant_delay + jitter;
        let seq = self.counter;
        self.counter += 1;
        self.queue.push(Reverse(Delayed {
            release_at,
            seq,
            datagram,
        }));
    }

    /// Takes the next datagram whose release time has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<Bytes> {
        if self.queue.peek().is_some_and(|head| head.0.release_at <= now) {
            self.queue.pop().map(|head| head.0.datagram)
        } else {
            None
        }
    }

    /// Gets when the next held-back datagram becomes due, if any.
    #[must_use]
    pub fn next_release(&self) -> Option<Instant> {
        self.queue.peek().map(|head| head.0.release_at)
    }

    /// Gets the number of datagrams currently held back.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no datagrams are held back.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            enabled: true,
            ..SimulatorConfig::default()
        }
    }

    #[test]
    fn no_delay_releases_immediately() {
        let mut sim = Simulator::new(config());
        let now = Instant::now();
        sim.offer(now, Bytes::from_static(b"a"));
        assert_eq!(Some(Bytes::from_static(b"a")), sim.pop_due(now));
        assert_eq!(None, sim.pop_due(now));
    }

    #[test]
    fn constant_delay_holds_datagrams_back() {
        let mut sim = Simulator::new(SimulatorConfig {
            constant_delay: Duration::from_millis(50),
            ..config()
        });
        let now = Instant::now();
        sim.offer(now, Bytes::from_static(b"a"));

        assert_eq!(None, sim.pop_due(now));
        assert_eq!(Some(now + Duration::from_millis(50)), sim.next_release());
        assert!(sim.pop_due(now + Duration::from_millis(50)).is_some());
    }

    #[test]
    fn equal_release_times_keep_submit_order() {
        let mut sim = Simulator::new(config());
        let now = Instant::now();
        sim.offer(now, Bytes::from_static(b"a"));
        sim.offer(now, Bytes::from_static(b"b"));
        assert_eq!(Some(Bytes::from_static(b"a")), sim.pop_due(now));
        assert_eq!(Some(Bytes::from_static(b"b")), sim.pop_due(now));
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut sim = Simulator::new(SimulatorConfig {
            packet_loss_rate: 1.0,
            ..config()
        });
        let now = Instant::now();
        for _ in 0..100 {
            sim.offer(now, Bytes::from_static(b"a"));
        }
        assert!(sim.is_empty());
    }

    #[test]
    fn same_seed_same_fate() {
        let lossy = SimulatorConfig {
            packet_loss_rate: 0.5,
            seed: 42,
            ..config()
        };
        let mut a = Simulator::new(lossy.clone());
        let mut b = Simulator::new(lossy);
        let now = Instant::now();
        for _ in 0..100 {
            a.offer(now, Bytes::from_static(b"x"));
            b.offer(now, Bytes::from_static(b"x"));
        }
        assert_eq!(a.len(), b.len());
    }
}
