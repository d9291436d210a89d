//! Seeded randomness: artificial datagram loss and print pacing.
//!
//! Both draws come from `StdRng` seeded out of the client configuration, so
//! a run's behavior under loss is reproducible from the seed alone.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Drops datagrams with probability `p`, on both the receive and the
/// transmit path of the client.
#[derive(Debug)]
pub struct LossSimulator {
    p: f64,
    rng: StdRng,
}

impl LossSimulator {
    pub fn new(p: f64, seed: u64) -> Self {
        Self {
            p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Decides the fate of one datagram.
    pub fn should_drop(&mut self) -> bool {
        self.p > 0.0 && self.rng.random::<f64>() <= self.p
    }
}

/// Exponentially distributed inter-print intervals with the configured mean,
/// in microseconds.
#[derive(Debug)]
pub struct PrintPacer {
    mean_micros: u32,
    rng: StdRng,
}

impl PrintPacer {
    pub fn new(mean_micros: u32, seed: u64) -> Self {
        Self {
            mean_micros,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        // Uniform draw mapped into (0, 1] so the logarithm stays finite.
        let u = 1.0 - self.rng.random::<f64>();
        Duration::from_micros((-(self.mean_micros as f64) * u.ln()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_probability_never_drops() {
        let mut sim = LossSimulator::new(0.0, 42);
        assert!((0..10_000).all(|_| !sim.should_drop()));
    }

    #[test]
    fn certain_probability_always_drops() {
        let mut sim = LossSimulator::new(1.0, 42);
        assert!((0..10_000).all(|_| sim.should_drop()));
    }

    #[test]
    fn same_seed_reproduces_the_drop_sequence() {
        let mut a = LossSimulator::new(0.3, 7);
        let mut b = LossSimulator::new(0.3, 7);
        let seq_a: Vec<bool> = (0..1000).map(|_| a.should_drop()).collect();
        let seq_b: Vec<bool> = (0..1000).map(|_| b.should_drop()).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().any(|&dropped| dropped));
        assert!(seq_a.iter().any(|&dropped| !dropped));
    }

    #[test]
    fn pacer_intervals_average_near_the_mean() {
        let mut pacer = PrintPacer::new(1000, 11);
        let total: u128 = (0..20_000)
            .map(|_| pacer.next_delay().as_micros())
            .sum();
        let mean = total / 20_000;
        assert!((500..2000).contains(&(mean as u64)));
    }
}
