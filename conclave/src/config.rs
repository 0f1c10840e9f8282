//! Cluster, timing, and network-fault configuration.

use std::ops::Range;
use std::time::Duration;

use rand::Rng;

use crate::core::types::NodeId;

/// Protocol timing knobs.
///
/// The election timeout is sampled fresh from the range on every arm, which
/// is what keeps split votes from recurring. The heartbeat interval is fixed
/// and must sit well below the low end of the election range.
#[derive(Clone, Debug)]
pub struct TimingConfig {
    pub election_timeout: Range<Duration>,
    pub heartbeat_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150)..Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

impl TimingConfig {
    /// Sample a fresh randomized election timeout.
    pub fn election_delay(&self, rng: &mut impl Rng) -> Duration {
        rng.random_range(self.election_timeout.clone())
    }
}

/// Configuration for exponential backoff with jitter, used by a proposer
/// whose ballot got outbid.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // Add jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Fault injection knobs for the simulated network. Defaults are a clean,
/// low-latency wire; scenario tests turn the dials up.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Per-message one-way delay, sampled uniformly.
    pub latency: Range<Duration>,
    /// Probability a message silently disappears.
    pub loss: f64,
    /// Probability a delivered message arrives twice.
    pub duplicate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5)..Duration::from_millis(25),
            loss: 0.0,
            duplicate: 0.0,
        }
    }
}

impl NetworkConfig {
    /// Sample one message's transit delay.
    pub fn delay(&self, rng: &mut impl Rng) -> Duration {
        rng.random_range(self.latency.clone())
    }
}

/// Everything needed to stand up one cluster.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Number of nodes; ids run `0..size`.
    pub size: usize,
    pub timing: TimingConfig,
    pub network: NetworkConfig,
    pub backoff: BackoffConfig,
    /// Master seed; every node and the router derive their own rng from it.
    pub seed: u64,
}

impl ClusterConfig {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_seed(size, 0)
    }

    /// Create a cluster config with a seed for deterministic behavior.
    #[must_use]
    pub fn with_seed(size: usize, seed: u64) -> Self {
        Self {
            size,
            timing: TimingConfig::default(),
            network: NetworkConfig::default(),
            backoff: BackoffConfig::default(),
            seed,
        }
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.size as u64).map(NodeId::new)
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.size / 2 + 1
    }
}
