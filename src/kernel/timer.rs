use core::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds since boot, counted in timer ticks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Ticks(u64);

impl Ticks {
    pub const fn in_secs(&self) -> u64 {
        self.0 / 1_000
    }

    pub const fn in_msecs(&self) -> u64 {
        self.0
    }

    pub const fn in_usecs(&self) -> u128 {
        self.0 as u128 * 1_000
    }
}

impl From<u64> for Ticks {
    fn from(ms: u64) -> Self {
        Self(ms)
    }
}

/// The boot-time clock. Only the bootstrap CPU advances it; everyone reads.
pub struct Timer {
    ticks: AtomicU64,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> Ticks {
        Ticks(self.ticks.load(Ordering::Acquire))
    }

    pub fn now_ms(&self) -> u64 {
        self.now().in_msecs()
    }

    /// One timer interrupt worth of time. Returns the new tick count.
    pub fn tick(&self) -> Ticks {
        Ticks(self.ticks.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Jump the clock forward; bring-up and deadline tests use this instead
    /// of delivering thousands of ticks.
    pub fn advance(&self, ms: u64) -> Ticks {
        Ticks(self.ticks.fetch_add(ms, Ordering::AcqRel) + ms)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
