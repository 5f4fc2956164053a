//! Timing configuration of the simulated link and memory system.

use std::time::Duration;

use crate::rng::sim_random_range;

/// Base latency plus uniformly sampled jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRange {
    /// Base latency duration
    pub base: Duration,
    /// Maximum additional jitter duration (0 to this value)
    pub jitter: Duration,
}

impl LatencyRange {
    /// Create a new latency range
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// Create a fixed latency with no jitter
    pub fn fixed(duration: Duration) -> Self {
        Self {
            base: duration,
            jitter: Duration::ZERO,
        }
    }

    /// Draw a latency from the simulation RNG.
    pub fn sample(&self) -> Duration {
        if self.jitter.is_zero() {
            self.base
        } else {
            let jitter_nanos = sim_random_range(0..(self.jitter.as_nanos() as u64 + 1));
            self.base + Duration::from_nanos(jitter_nanos)
        }
    }
}

/// Delivery behavior of the links feeding each node.
///
/// Packets to one node arrive in injection order whatever latency they
/// draw, so per-conversation order is always preserved.
#[derive(Debug, Clone)]
pub struct LinkConfiguration {
    /// Latency of one packet from injection to the receive link
    pub latency: LatencyRange,
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        Self {
            latency: LatencyRange::new(Duration::from_nanos(500), Duration::from_nanos(200)),
        }
    }
}

impl LinkConfiguration {
    /// Zero-latency links.
    pub fn instant() -> Self {
        Self {
            latency: LatencyRange::fixed(Duration::ZERO),
        }
    }

    /// Randomized latency drawn from the current seed.
    pub fn random_for_seed() -> Self {
        let base = sim_random_range(50..2_000);
        let jitter = sim_random_range(0..5_000);
        Self {
            latency: LatencyRange::new(Duration::from_nanos(base), Duration::from_nanos(jitter)),
        }
    }
}

/// Fixed plus per-byte cost of one kind of memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCost {
    /// Cost paid by every access
    pub fixed: Duration,
    /// Cost of each byte moved
    pub per_byte: Duration,
}

impl AccessCost {
    /// Create a cost model.
    pub fn new(fixed: Duration, per_byte: Duration) -> Self {
        Self { fixed, per_byte }
    }

    /// Free access.
    pub fn zero() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay of an access moving `bytes`.
    pub fn delay(&self, bytes: usize) -> Duration {
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        self.fixed + self.per_byte.saturating_mul(bytes)
    }
}

/// Delay model for the three kinds of memory traffic a stream causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTiming {
    /// Host memory reads
    pub host_read: AccessCost,
    /// Host memory writes
    pub host_write: AccessCost,
    /// NIC-local accesses (translation, atomics)
    pub nic_access: AccessCost,
}

impl Default for MemoryTiming {
    fn default() -> Self {
        Self {
            host_read: AccessCost::new(Duration::from_nanos(200), Duration::from_nanos(1)),
            host_write: AccessCost::new(Duration::from_nanos(150), Duration::from_nanos(1)),
            nic_access: AccessCost::new(Duration::from_nanos(20), Duration::ZERO),
        }
    }
}

impl MemoryTiming {
    /// Every access completes without delay.
    pub fn instant() -> Self {
        Self {
            host_read: AccessCost::zero(),
            host_write: AccessCost::zero(),
            nic_access: AccessCost::zero(),
        }
    }

    /// Randomized costs drawn from the current seed.
    pub fn random_for_seed() -> Self {
        let cost = |fixed: std::ops::Range<u64>, per_byte: std::ops::Range<u64>| {
            AccessCost::new(
                Duration::from_nanos(sim_random_range(fixed)),
                Duration::from_nanos(sim_random_range(per_byte)),
            )
        };
        Self {
            host_read: cost(50..1_000, 0..4),
            host_write: cost(50..1_000, 0..4),
            nic_access: cost(1..200, 0..1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::set_sim_seed;

    #[test]
    fn latency_sample_stays_in_range() {
        set_sim_seed(3);
        let range = LatencyRange::new(Duration::from_nanos(100), Duration::from_nanos(50));
        for _ in 0..100 {
            let latency = range.sample();
            assert!(latency >= Duration::from_nanos(100));
            assert!(latency <= Duration::from_nanos(150));
        }
        assert_eq!(LatencyRange::fixed(Duration::from_nanos(9)).sample(), Duration::from_nanos(9));
    }

    #[test]
    fn access_cost_scales_with_bytes() {
        let cost = AccessCost::new(Duration::from_nanos(10), Duration::from_nanos(2));
        assert_eq!(cost.delay(0), Duration::from_nanos(10));
        assert_eq!(cost.delay(5), Duration::from_nanos(20));
        assert_eq!(MemoryTiming::instant().host_read.delay(1024), Duration::ZERO);
    }
}
