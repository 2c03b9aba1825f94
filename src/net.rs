//! Shared reconnection policy for the resilient stream clients.
//!
//! Every network client in the pipeline (the dump1090 feed reader and the
//! WebSocket subscriber) reconnects with the same exponential backoff:
//! start at 500 ms, double on each failure, cap at 10 s, reset after a
//! successful connection.

use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to sleep before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
