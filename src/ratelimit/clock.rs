//! Wall-clock abstraction so timing can be controlled in tests.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Source of the current time, in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_nanos(&self) -> i64;

    fn now_millis(&self) -> i64 {
        self.now_nanos().div_euclid(NANOS_PER_MILLI)
    }
}

/// Clock backed by the system's UTC wall clock.
///
/// Stored limiter state is shared across processes, so this must be a
/// wall clock rather than a monotonic one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        let now = Utc::now();
        now.timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_millis().saturating_mul(NANOS_PER_MILLI))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given millisecond timestamp.
    pub fn at_millis(millis: i64) -> Self {
        Self {
            nanos: AtomicI64::new(millis * NANOS_PER_MILLI),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: std::time::Duration) {
        let nanos = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Jump to an absolute millisecond timestamp.
    pub fn set_millis(&self, millis: i64) {
        self.nanos.store(millis * NANOS_PER_MILLI, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
