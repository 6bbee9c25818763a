//! Time sources for instruments.
//!
//! No instrument schedules its own timers. Every cadence decision (window
//! rolls, write gates, snapshot throttles, history buckets) is made lazily by
//! comparing a stored instant against [`Clock::now`]. Instruments default to
//! [`SystemClock`]; tests and simulations drive them with [`ManualClock`].

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// A source of wall-clock time.
pub trait Clock: Debug + Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The process wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use tally::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::from_unix(1_700_000_000);
/// clock.advance(Duration::from_secs(90));
/// assert_eq!(clock.now().timestamp(), 1_700_000_090);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Creates a clock frozen at the given unix second.
    ///
    /// Out-of-range seconds fall back to the unix epoch.
    pub fn from_unix(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Moves the clock forward. Saturates instead of overflowing.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Ok(delta) = TimeDelta::from_std(by)
            && let Some(next) = now.checked_add_signed(delta)
        {
            *now = next;
        }
    }

    /// Jumps the clock to an arbitrary instant, possibly backwards.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Time elapsed from `then` to `now`, clamped to zero if the clock went backwards.
pub(crate) fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}
