//! # Time Source Abstraction
//!
//! Every expiry and cooldown decision in the bridge (queue expiration,
//! circuit breaker cooldown, reconnection budget) reads the clock through
//! this trait instead of calling `Instant::now()` directly, so boundary
//! conditions can be tested deterministically with a manual clock.

use std::time::Instant;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real clock used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
///
/// Starts at an arbitrary `Instant` and only moves when `advance` is called,
/// so expiry-boundary assertions don't race the wall clock.
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::Mutex<Instant>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
