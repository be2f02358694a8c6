//! Jittered polling schedule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Result of asking the scheduler whether to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub due: bool,
    /// Bound drawn for this call
    pub jitter_secs: u64,
    pub elapsed_secs: u64,
}

/// Decides when the next data pull is due.
///
/// The bound is redrawn on every call from an RNG seeded with the current
/// time, so consecutive runs do not poll in lockstep.
#[derive(Debug, Clone)]
pub struct PollingScheduler {
    interval_secs: u64,
    jitter_secs: u64,
    /// Unix seconds of the last accepted poll
    last_fetch: u64,
}

impl PollingScheduler {
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            interval_secs,
            jitter_secs,
            last_fetch: 0,
        }
    }

    /// Draw a bound uniformly from `[interval - jitter, interval + jitter]`, floored at zero.
    pub fn draw_jitter(&self, seed: u64) -> u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let low = self.interval_secs.saturating_sub(self.jitter_secs);
        let high = self.interval_secs + self.jitter_secs;
        rng.gen_range(low..=high)
    }

    /// Whether a poll is due at `now` (unix seconds). The first run step is always due.
    pub fn poll(&mut self, now: u64, run_step: u64) -> Tick {
        let elapsed = now.saturating_sub(self.last_fetch);
        let jitter = self.draw_jitter(now);
        let due = run_step == 0 || elapsed > jitter;

        if due {
            debug!(elapsed, jitter, run_step, "Poll due");
            self.last_fetch = now;
        }

        Tick {
            due,
            jitter_secs: jitter,
            elapsed_secs: elapsed,
        }
    }
}
