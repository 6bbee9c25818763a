//! Rolling window counter.
//!
//! A [`RollingWindowCounter`] keeps one monotonically incremented total and,
//! for each registered window ("1m", "5m", "1d", ...), the total as of that
//! window's last aligned boundary. Reading a window past its boundary returns
//! the delta and rate accumulated since the previous boundary and rolls the
//! window forward by exactly one period.
//!
//! # Window lifecycle
//!
//! ```text
//!   register "5m" at 10:03:12        next boundary = 10:05:00
//!   read at 10:04:59                 None (boundary not reached)
//!   read at 10:05:02                 Some(delta since registration), next = 10:10:00
//!   read at 10:05:30                 None (same window already reported)
//! ```
//!
//! Reads are the roll trigger: nothing happens at a boundary until someone
//! asks. A window that is not read for several periods catches up one period
//! per read.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::align;
use crate::clock::{self, Clock, SystemClock};
use crate::config::validate_period;
use crate::error::Result;
use crate::registry::Registry;

/// Delta and per-second rate of one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowRate {
    /// Increments since the previous boundary.
    pub delta: i64,
    /// `delta` divided by the window width in seconds.
    pub rate: f64,
}

/// A counter with clock-aligned, per-window deltas and rates.
///
/// # Thread Safety
///
/// All state sits behind one reader/writer lock. `count`, `periods` and
/// `writable` take the shared side; everything that may roll a window takes
/// the exclusive side.
#[derive(Debug)]
pub struct RollingWindowCounter {
    clock: Arc<dyn Clock>,
    state: RwLock<CounterState>,
}

#[derive(Debug)]
struct CounterState {
    count: i64,
    windows: BTreeMap<String, Window>,
    /// Shortest registered period; gates [`RollingWindowCounter::snapshot`].
    min_period: Duration,
    last_snapshot: DateTime<Utc>,
}

#[derive(Debug)]
struct Window {
    period: Duration,
    /// Total as of the last accepted boundary.
    baseline: i64,
    /// Unix second at which the window may report next.
    next_boundary: i64,
}

impl Window {
    fn roll(&mut self, label: &str, count: i64, now_ts: i64) -> Option<WindowRate> {
        if now_ts < self.next_boundary {
            return None;
        }

        let step = i64::try_from(self.period.as_secs()).unwrap_or(i64::MAX);
        self.next_boundary = self.next_boundary.saturating_add(step);

        let delta = count.wrapping_sub(self.baseline);
        self.baseline = count;

        #[allow(clippy::cast_precision_loss)] // rates are approximate by nature
        let rate = delta as f64 / self.period.as_secs_f64();

        tracing::debug!("window {label} rolled: delta={delta} rate={rate}");
        Some(WindowRate { delta, rate })
    }
}

impl CounterState {
    fn refresh_min_period(&mut self) {
        self.min_period = self
            .windows
            .values()
            .map(|w| w.period)
            .min()
            .unwrap_or(Duration::ZERO);
    }
}

impl Default for RollingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingWindowCounter {
    /// Creates a counter with no windows, using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a counter with no windows, reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let last_snapshot = clock.now();
        Self {
            clock,
            state: RwLock::new(CounterState {
                count: 0,
                windows: BTreeMap::new(),
                min_period: Duration::ZERO,
                last_snapshot,
            }),
        }
    }

    /// Resolves the counter named `name`, creating it with `periods` if needed.
    ///
    /// An existing counter is returned as is; `periods` only apply to a newly
    /// created one.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another type or a period is
    /// invalid.
    pub fn get_or_register(
        registry: &Registry,
        name: &str,
        periods: &BTreeMap<String, Duration>,
    ) -> Result<Arc<Self>> {
        registry.get_or_register(name, || {
            let counter = Self::new();
            counter.set_periods(periods.iter().map(|(l, p)| (l.as_str(), *p)))?;
            Ok(counter)
        })
    }

    /// Adds `delta` to the running total, wrapping on overflow.
    pub fn inc(&self, delta: i64) {
        let mut state = self.state.write();
        state.count = state.count.wrapping_add(delta);
    }

    /// Resets the total to zero and forgets every window baseline.
    ///
    /// Window registrations and their boundary schedules are kept.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.count = 0;
        for window in state.windows.values_mut() {
            window.baseline = 0;
        }
    }

    /// Returns the running total.
    pub fn count(&self) -> i64 {
        self.state.read().count
    }

    /// Registers a window. Re-registering an existing label is a no-op and
    /// keeps its boundary schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if the label is
    /// empty or the period is shorter than one second or not a whole number
    /// of seconds.
    pub fn set_period(&self, label: &str, period: Duration) -> Result<()> {
        self.set_periods([(label, period)])
    }

    /// Registers several windows at once.
    ///
    /// Every entry is validated before any is applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) for the first
    /// invalid entry; nothing is registered in that case.
    pub fn set_periods<I, K>(&self, periods: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Duration)>,
        K: Into<String>,
    {
        let periods: Vec<(String, Duration)> = periods
            .into_iter()
            .map(|(label, period)| (label.into(), period))
            .collect();
        for (label, period) in &periods {
            validate_period(label, *period)?;
        }

        let now = self.clock.now().with_timezone(&Local);
        let mut state = self.state.write();
        for (label, period) in periods {
            state.windows.entry(label).or_insert_with(|| Window {
                period,
                baseline: 0,
                next_boundary: align::next_boundary(period, &now),
            });
        }
        state.refresh_min_period();
        Ok(())
    }

    /// Unregisters a window. Returns whether it existed.
    pub fn remove_period(&self, label: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.windows.remove(label).is_some();
        state.refresh_min_period();
        removed
    }

    /// Returns the registered window labels in sorted order.
    pub fn periods(&self) -> Vec<String> {
        self.state.read().windows.keys().cloned().collect()
    }

    /// Returns the unix second at which `label` may report next.
    pub fn next_boundary(&self, label: &str) -> Option<i64> {
        self.state.read().windows.get(label).map(|w| w.next_boundary)
    }

    /// Returns the delta and rate of `label` since its previous boundary, and
    /// rolls the window forward one period.
    ///
    /// Returns `None` when `label` is unknown or its boundary has not been
    /// reached yet. A second call within the same window therefore returns
    /// `None` rather than repeating the first result.
    pub fn latest_period_count_rate(&self, label: &str) -> Option<WindowRate> {
        let now_ts = self.clock.now().timestamp();
        let mut state = self.state.write();
        let count = state.count;
        state
            .windows
            .get_mut(label)
            .and_then(|window| window.roll(label, count, now_ts))
    }

    /// Reports whether the shortest window has elapsed since the last
    /// accepted snapshot.
    pub fn writable(&self) -> bool {
        let now = self.clock.now();
        let state = self.state.read();
        clock::elapsed(now, state.last_snapshot) >= state.min_period
    }

    /// Takes a snapshot, rolling every window whose boundary has passed.
    ///
    /// Snapshots are throttled to one per shortest window. A throttled
    /// snapshot is flagged not writable and carries no window values.
    pub fn snapshot(&self) -> RollingWindowSnapshot {
        let now = self.clock.now();
        let mut state = self.state.write();

        if clock::elapsed(now, state.last_snapshot) < state.min_period {
            tracing::trace!("window snapshot throttled");
            return RollingWindowSnapshot {
                count: state.count,
                writable: false,
                windows: BTreeMap::new(),
            };
        }
        state.last_snapshot = now;

        let now_ts = now.timestamp();
        let count = state.count;
        let windows = state
            .windows
            .iter_mut()
            .map(|(label, window)| (label.clone(), window.roll(label, count, now_ts)))
            .collect();

        RollingWindowSnapshot {
            count,
            writable: true,
            windows,
        }
    }
}

/// A read-only copy of a [`RollingWindowCounter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingWindowSnapshot {
    count: i64,
    writable: bool,
    windows: BTreeMap<String, Option<WindowRate>>,
}

impl RollingWindowSnapshot {
    /// The running total at snapshot time.
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Whether this snapshot was accepted for persistence.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Labels of the windows captured by this snapshot.
    pub fn periods(&self) -> Vec<String> {
        self.windows.keys().cloned().collect()
    }

    /// The delta and rate `label` reported in this snapshot, if it rolled.
    pub fn latest_period_count_rate(&self, label: &str) -> Option<WindowRate> {
        self.windows.get(label).copied().flatten()
    }
}
