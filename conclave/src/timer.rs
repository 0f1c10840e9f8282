//! Clock plumbing for the node event loop.
//!
//! The election deadline is one pinned [`Sleep`] that gets pushed around:
//! re-armed with a fresh randomized timeout on leader contact, or with
//! jittered exponential backoff after a lost ballot duel. Everything runs on
//! tokio time, so tests drive it with a paused clock.

use std::pin::Pin;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::config::{BackoffConfig, TimingConfig};
use crate::core::engine::TimerCmd;

pub struct ElectionTimer {
    timing: TimingConfig,
    backoff: BackoffConfig,
    rng: StdRng,
    deadline: Pin<Box<Sleep>>,
}

impl ElectionTimer {
    #[must_use]
    pub fn new(timing: TimingConfig, backoff: BackoffConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let first = timing.election_delay(&mut rng);
        Self {
            timing,
            backoff,
            rng,
            deadline: Box::pin(tokio::time::sleep(first)),
        }
    }

    /// Wait for the deadline, then immediately re-arm with a fresh random
    /// timeout so a completed deadline never spins. Cancel-safe.
    pub async fn fired(&mut self) {
        self.deadline.as_mut().await;
        self.rearm();
    }

    /// Push the deadline out by a fresh randomized election timeout.
    pub fn rearm(&mut self) {
        let delay = self.timing.election_delay(&mut self.rng);
        self.deadline.as_mut().reset(Instant::now() + delay);
    }

    /// Push the deadline out by jittered exponential backoff.
    pub fn rearm_backoff(&mut self, attempt: u32) {
        let delay = self.backoff.duration(attempt, &mut self.rng);
        self.deadline.as_mut().reset(Instant::now() + delay);
    }

    /// Apply an engine's re-arm request.
    pub fn apply(&mut self, cmd: TimerCmd) {
        match cmd {
            TimerCmd::ResetElection => self.rearm(),
            TimerCmd::Backoff { attempt } => self.rearm_backoff(attempt),
        }
    }
}

/// The fixed heartbeat cadence. Missed ticks are delayed rather than
/// bursted, which matters under a paused test clock.
#[must_use]
pub fn heartbeat_interval(timing: &TimingConfig) -> Interval {
    let mut interval = tokio::time::interval(timing.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
