//! Clock sources for lifecycle decisions
//!
//! The scheduler never reads wall time directly. Tests drive a
//! [`ManualClock`] forward instead of sleeping.

use crate::{Nanos, Timestamp};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time in nanoseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// Current time as a `DateTime`, for logging
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now())
    }
}

/// Wall clock that never goes backward.
///
/// If the system clock steps back (NTP adjustment), the previous
/// high-water mark is returned instead.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water_ns: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let prev = self.high_water_ns.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_ns: AtomicI64::new(start),
        }
    }

    /// Move the clock forward by `delta` and return the new time
    pub fn advance(&self, delta: Nanos) -> Timestamp {
        self.now_ns.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn set(&self, ts: Timestamp) {
        self.now_ns.store(ts, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now_ns.load(Ordering::Acquire)
    }
}
