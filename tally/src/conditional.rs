//! Write-gated scalar values.
//!
//! A conditional value is updated continuously but only reports itself as
//! "writable" once per period. Exporters call [`ConditionalValue::snapshot`]
//! on every tick and persist only the snapshots flagged writable, which turns
//! a fast-moving update stream into a slow, regular persistence stream.
//!
//! The snapshot is the only operation that advances the gate. Updates and
//! [`ConditionalValue::writable`] checks are side-effect free with respect to
//! it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::{self, Clock, SystemClock};
use crate::error::Result;
use crate::registry::Registry;

/// A gated integer value.
pub type ConditionalInt = ConditionalValue<i64>;
/// A gated float value.
pub type ConditionalFloat = ConditionalValue<f64>;

/// A scalar that reports when enough time has passed to persist it again.
#[derive(Debug)]
pub struct ConditionalValue<T> {
    period: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<GateState<T>>,
}

#[derive(Debug)]
struct GateState<T> {
    value: T,
    last_accepted: DateTime<Utc>,
}

/// A read-only copy of a [`ConditionalValue`].
///
/// A snapshot that is not writable still carries the current value. Callers
/// must check [`writable`](Self::writable) rather than infer anything from the
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConditionalSnapshot<T> {
    value: T,
    writable: bool,
}

impl<T: Copy> ConditionalSnapshot<T> {
    /// The value at the time the snapshot was taken.
    pub fn value(&self) -> T {
        self.value
    }

    /// Whether this snapshot was accepted for persistence.
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl<T> ConditionalValue<T>
where
    T: Copy + Default + Send + 'static,
{
    /// Creates a value gated on `period`, using the system clock.
    ///
    /// The gate starts closed: the first writable instant is one period after
    /// construction.
    pub fn new(period: Duration) -> Self {
        Self::with_clock(period, Arc::new(SystemClock))
    }

    /// Creates a value gated on `period`, reading time from `clock`.
    pub fn with_clock(period: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_accepted = clock.now();
        Self {
            period,
            clock,
            state: Mutex::new(GateState {
                value: T::default(),
                last_accepted,
            }),
        }
    }

    /// Resolves the value named `name`, creating it with `period` if needed.
    ///
    /// An existing value keeps its original period.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another instrument type.
    pub fn get_or_register(registry: &Registry, name: &str, period: Duration) -> Result<Arc<Self>>
    where
        T: Sync,
    {
        registry.get_or_register(name, || Ok(Self::new(period)))
    }

    /// Replaces the value. Does not touch the gate.
    pub fn update(&self, v: T) {
        self.state.lock().value = v;
    }

    /// Returns the current value.
    pub fn value(&self) -> T {
        self.state.lock().value
    }

    /// Returns the gate period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Reports whether a snapshot taken now would be writable.
    pub fn writable(&self) -> bool {
        let now = self.clock.now();
        clock::elapsed(now, self.state.lock().last_accepted) >= self.period
    }

    /// Takes a snapshot, opening the gate if the period has elapsed.
    ///
    /// A writable snapshot restarts the period from now.
    pub fn snapshot(&self) -> ConditionalSnapshot<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let writable = clock::elapsed(now, state.last_accepted) >= self.period;
        if writable {
            state.last_accepted = now;
        }

        ConditionalSnapshot {
            value: state.value,
            writable,
        }
    }
}
