//! Hosted clock backing the protocol core's `Timebase` trait.

use std::thread;
use std::time::{Duration, Instant};

use mcp_core::waiter::Timebase;

/// Monotonic OS clock with a sleeping pause.
///
/// `now` reports time elapsed since construction, which matches the
/// trait's arbitrary-origin contract.
pub struct StdTimebase {
    origin: Instant,
}

impl StdTimebase {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl Timebase for StdTimebase {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn pause(&self, interval: Duration) {
        thread::sleep(interval);
    }
}
