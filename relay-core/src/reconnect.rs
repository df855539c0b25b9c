//! Wait between reconnect attempts.
//!
//! By default every attempt waits `reconnect_time_wait`. Setting
//! `reconnect_time_wait_max` turns on doubling per failed attempt, capped at
//! that maximum. A zero maximum means the wait never grows.

use std::time::Duration;

use crate::options::ClientOptions;

/// Highest doubling applied, so the shift below cannot overflow.
const MAX_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone)]
pub struct ReconnectState {
    wait: Duration,
    ceiling: Option<Duration>,
    failures: u32,
}

impl ReconnectState {
    pub fn new(options: &ClientOptions) -> Self {
        let ceiling = (!options.reconnect_time_wait_max.is_zero())
            .then(|| options.reconnect_time_wait_max.max(options.reconnect_time_wait));
        Self {
            wait: options.reconnect_time_wait,
            ceiling,
            failures: 0,
        }
    }

    /// Wait to apply before the next attempt; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.ceiling {
            None => self.wait,
            Some(ceiling) => self
                .wait
                .saturating_mul(1 << self.failures.min(MAX_DOUBLINGS))
                .min(ceiling),
        };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// A connection succeeded; start over from the base wait.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Attempts since the last success.
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}
