//! Clock seam so scheduling decisions (cooldown, debounce, retry timing)
//! can be driven deterministically in tests instead of calling
//! `chrono::Utc::now()` / `Instant::now()` directly everywhere.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Wall-clock + monotonic clock used for scheduling. Both are mixed:
/// `next_retry_at` uses wall clock, the in-process cooldown/debounce maps
/// use a monotonic clock so they're immune to NTP jumps.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A controllable clock for deterministic tests. Wraps an offset applied to
/// real time rather than faking `Instant` (which cannot be constructed out
/// of thin air), so elapsed-time comparisons against real `Instant`s
/// created earlier in a test still behave sanely.
#[derive(Debug)]
pub struct TestClock {
    offset_secs: AtomicI64,
    base_utc: DateTime<Utc>,
    base_instant: Instant,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            offset_secs: AtomicI64::new(0),
            base_utc: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.offset_secs.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.base_utc + chrono::Duration::seconds(self.offset_secs.load(Ordering::SeqCst))
    }

    fn monotonic_now(&self) -> Instant {
        self.base_instant
            + std::time::Duration::from_secs(self.offset_secs.load(Ordering::SeqCst).max(0) as u64)
    }
}
