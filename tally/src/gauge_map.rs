//! Keyed gauge with one step of lookback.
//!
//! A [`KeyedGauge`] is a flat map of scalars and scalar-producing functions.
//! Every update copies the key's prior value into a `previous` slot first, so
//! functions can compute deltas against exactly one earlier generation. There
//! is no history table, no throttle, and no period.
//!
//! ```rust
//! use tally::gauge_map::{GaugeFn, KeyedGauge};
//!
//! let gauge = KeyedGauge::new();
//! gauge.set_func_key("delta", GaugeFn::int(|g| {
//!     g.value_i64("i").unwrap_or(0) - g.previous_i64("i").unwrap_or(0)
//! }));
//!
//! gauge.update_int64("i", 100);
//! gauge.update_int64("i", 300);
//! assert_eq!(gauge.snapshot().value_i64("delta"), Some(200));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Result;
use crate::instrument::{Scalar, ValueKind};
use crate::registry::Registry;

type IntFn = dyn Fn(&GaugeView<'_>) -> i64 + Send + Sync;
type FloatFn = dyn Fn(&GaugeView<'_>) -> f64 + Send + Sync;

/// A function-valued gauge entry, tagged with the kind of value it returns.
#[derive(Clone)]
pub enum GaugeFn {
    /// Returns an integer.
    Int(Arc<IntFn>),
    /// Returns a float.
    Float(Arc<FloatFn>),
}

impl GaugeFn {
    /// Wraps an integer-valued function.
    pub fn int<F>(f: F) -> Self
    where
        F: Fn(&GaugeView<'_>) -> i64 + Send + Sync + 'static,
    {
        Self::Int(Arc::new(f))
    }

    /// Wraps a float-valued function.
    pub fn float<F>(f: F) -> Self
    where
        F: Fn(&GaugeView<'_>) -> f64 + Send + Sync + 'static,
    {
        Self::Float(Arc::new(f))
    }

    /// The kind of value this function returns.
    pub fn value_kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
        }
    }

    fn evaluate(&self, view: &GaugeView<'_>) -> Scalar {
        match self {
            Self::Int(f) => Scalar::Int(f(view)),
            Self::Float(f) => Scalar::Float(f(view)),
        }
    }
}

impl fmt::Debug for GaugeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(_) => f.write_str("GaugeFn::Int"),
            Self::Float(_) => f.write_str("GaugeFn::Float"),
        }
    }
}

#[derive(Debug, Clone)]
enum GaugeEntry {
    Value(Scalar),
    Func(GaugeFn),
}

/// Read-only view handed to gauge functions.
///
/// Only plain entries are visible; function entries never see each other.
#[derive(Debug, Clone, Copy)]
pub struct GaugeView<'a> {
    entries: &'a BTreeMap<String, GaugeEntry>,
    previous: &'a HashMap<String, Scalar>,
}

impl GaugeView<'_> {
    /// The current value of the plain entry `key`.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        match self.entries.get(key) {
            Some(GaugeEntry::Value(v)) => Some(*v),
            _ => None,
        }
    }

    /// The current value of `key` if it is an integer.
    pub fn value_i64(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Scalar::as_i64)
    }

    /// The current value of `key` if it is a float.
    pub fn value_f64(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(Scalar::as_f64)
    }

    /// The value `key` held before its latest update.
    ///
    /// The zero of the current kind after a key's first update; `None` if it
    /// was never updated.
    pub fn previous(&self, key: &str) -> Option<Scalar> {
        self.previous.get(key).copied()
    }

    /// Integer form of [`previous`](Self::previous).
    pub fn previous_i64(&self, key: &str) -> Option<i64> {
        self.previous(key).and_then(Scalar::as_i64)
    }

    /// Float form of [`previous`](Self::previous).
    pub fn previous_f64(&self, key: &str) -> Option<f64> {
        self.previous(key).and_then(Scalar::as_f64)
    }
}

/// A map of gauges with single-step lookback.
#[derive(Debug, Default)]
pub struct KeyedGauge {
    state: RwLock<GaugeState>,
}

#[derive(Debug, Default)]
struct GaugeState {
    entries: BTreeMap<String, GaugeEntry>,
    previous: HashMap<String, Scalar>,
}

impl GaugeState {
    fn view(&self) -> GaugeView<'_> {
        GaugeView {
            entries: &self.entries,
            previous: &self.previous,
        }
    }

    fn resolve(&self, entry: &GaugeEntry) -> Scalar {
        match entry {
            GaugeEntry::Value(v) => *v,
            GaugeEntry::Func(f) => f.evaluate(&self.view()),
        }
    }
}

impl KeyedGauge {
    /// Creates an empty gauge map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the gauge map named `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another instrument type.
    pub fn get_or_register(registry: &Registry, name: &str) -> Result<Arc<Self>> {
        registry.get_or_register(name, || Ok(Self::new()))
    }

    /// Sets the integer value of `key`.
    pub fn update_int64(&self, key: &str, v: i64) {
        self.update(key, Scalar::Int(v));
    }

    /// Sets the float value of `key`.
    pub fn update_float64(&self, key: &str, v: f64) {
        self.update(key, Scalar::Float(v));
    }

    /// Sets the value of `key`, first moving its prior value to `previous`.
    ///
    /// A key seen for the first time, one that held a function, or one whose
    /// old value was of the other kind gets the zero of the new value's kind
    /// as its previous value.
    pub fn update(&self, key: &str, v: Scalar) {
        let mut state = self.state.write();
        let prior = match state.entries.get(key) {
            Some(GaugeEntry::Value(old)) if old.kind() == v.kind() => *old,
            _ => Scalar::zero(v.kind()),
        };
        state.previous.insert(key.to_string(), prior);
        state.entries.insert(key.to_string(), GaugeEntry::Value(v));
    }

    /// Stores a function under `key`, replacing any value there.
    pub fn set_func_key(&self, key: &str, f: GaugeFn) {
        self.state
            .write()
            .entries
            .insert(key.to_string(), GaugeEntry::Func(f));
    }

    /// The live value of `key`, evaluating it if it is a function.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        let state = self.state.read();
        state.entries.get(key).map(|entry| state.resolve(entry))
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state.read().entries.keys().cloned().collect()
    }

    /// Evaluates every entry once into an immutable, split-by-kind copy.
    pub fn snapshot(&self) -> GaugeMapSnapshot {
        let state = self.state.read();
        let mut snapshot = GaugeMapSnapshot::default();
        for (key, entry) in &state.entries {
            match state.resolve(entry) {
                Scalar::Int(v) => {
                    snapshot.ints.insert(key.clone(), v);
                }
                Scalar::Float(v) => {
                    snapshot.floats.insert(key.clone(), v);
                }
            }
        }
        snapshot
    }
}

/// A read-only copy of a [`KeyedGauge`], split by value kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GaugeMapSnapshot {
    ints: BTreeMap<String, i64>,
    floats: BTreeMap<String, f64>,
}

impl GaugeMapSnapshot {
    /// The value of `key`.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        self.ints
            .get(key)
            .map(|v| Scalar::Int(*v))
            .or_else(|| self.floats.get(key).map(|v| Scalar::Float(*v)))
    }

    /// The value of `key` if it is an integer.
    pub fn value_i64(&self, key: &str) -> Option<i64> {
        self.ints.get(key).copied()
    }

    /// The value of `key` if it is a float.
    pub fn value_f64(&self, key: &str) -> Option<f64> {
        self.floats.get(key).copied()
    }

    /// The integer entries.
    pub fn ints(&self) -> &BTreeMap<String, i64> {
        &self.ints
    }

    /// The float entries.
    pub fn floats(&self) -> &BTreeMap<String, f64> {
        &self.floats
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.ints.keys().chain(self.floats.keys()).cloned().collect();
        keys.sort();
        keys
    }
}
