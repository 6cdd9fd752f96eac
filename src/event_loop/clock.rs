//! Time sources for the scheduler

use std::cell::Cell;
use std::time::Instant;

/// Millisecond time source driving timer expiry
pub trait Clock {
    /// Milliseconds since the clock's origin
    fn now_ms(&self) -> u64;

    /// Jump forward to `ms` if this clock is virtual. Returns `false` for
    /// clocks that follow real time, in which case the caller has to wait.
    fn advance_to(&self, _ms: u64) -> bool {
        false
    }
}

/// Monotonic wall clock
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Virtual clock that only moves when told to
///
/// Used for deterministic tests: `run_until_idle` jumps it straight to the
/// next timer when nothing else is runnable.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance virtual time by `ms`
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().saturating_add(ms));
    }

    /// Set virtual time; time never moves backwards
    pub fn set(&self, ms: u64) {
        if ms > self.now.get() {
            self.now.set(ms);
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn advance_to(&self, ms: u64) -> bool {
        self.set(ms);
        true
    }
}
