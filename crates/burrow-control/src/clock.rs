//! Injected time source
//!
//! Timeouts and idle-eviction decisions go through a [`Clock`] so tests can
//! advance time deterministically instead of sleeping.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic + wall-clock time source
pub trait Clock: Send + Sync {
    /// Monotonic instant for deadlines and idle measurement
    fn now(&self) -> Instant;

    /// Wall-clock timestamp for descriptor bookkeeping
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
pub struct ManualClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.offset.lock().unwrap()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().unwrap();
        self.base_utc + ChronoDuration::from_std(offset).unwrap_or(ChronoDuration::zero())
    }
}
