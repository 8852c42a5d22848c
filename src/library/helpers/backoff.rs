//! Exponential backoff implementations

use rand::Rng;
use std::{iter::Iterator, time::Duration};

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a
/// specified limit of iterations is reached. The first element is the initial delay, each
/// following element is the previous one multiplied by the `multiplier`.
///
/// With jitter enabled, a random amount of up to half the current delay is added to every
/// element. Peers retrying in lockstep thereby spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    current: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 2, 13)
    }
}

impl Backoff {
    /// Creates a backoff yielding `limit` delays starting at `initial`
    pub fn new(initial: Duration, multiplier: u32, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier: multiplier.max(1),
            current: initial,
            jitter: false,
        }
    }

    /// Adds random jitter to each delay
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let bound = (delay.as_millis() / 2) as u64;

        if !self.jitter || bound == 0 {
            return delay;
        }

        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.retries += 1;

        if self.retries > self.limit {
            return None;
        }

        if self.retries > 1 {
            self.current *= self.multiplier;
        }

        Some(self.jittered(self.current))
    }
}
