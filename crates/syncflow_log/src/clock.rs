//! Millisecond clock for record timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Strictly increasing millisecond clock.
///
/// Each tick is at least the wall clock and strictly greater than the
/// previous tick, so timestamps within one log never repeat or go backwards.
#[derive(Debug, Default)]
pub struct LogClock {
    last: AtomicU64,
}

impl LogClock {
    /// Creates a clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next timestamp.
    pub fn tick(&self) -> u64 {
        let wall = now_millis();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advances the clock past an externally observed timestamp.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Returns the last issued timestamp.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}
