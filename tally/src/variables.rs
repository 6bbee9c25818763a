//! Variable store: independent values, aligned history, and dependent values.
//!
//! A [`VariableStore`] holds the latest value of every independent key, a
//! full copy of those values per history period (taken at the period's most
//! recent aligned boundary), and a set of dependent variables computed from
//! both. [`VariableStore::snapshot`] is meant to be driven by an exporter
//! loop; it is throttled, so calling it more often than the configured
//! interval is cheap.
//!
//! # Snapshot order
//!
//! An accepted snapshot runs, under the store's write lock:
//!
//! 1. publish every independent key that has an instrument kind
//! 2. evaluate every dependent variable whose own period has elapsed
//! 3. roll every history bucket whose boundary has passed, one period at most
//!
//! Dependent functions therefore see history as it was before this snapshot
//! rolled it.
//!
//! # Dependent functions
//!
//! Functions receive a [`VariableView`], a read-only borrow of the store's
//! state taken under the lock the snapshot already holds. They cannot reach
//! the store itself, so re-entrant locking is impossible by construction.
//!
//! Missing history is reported as `None`. Turning that into a default, and
//! guarding ratios against a zero denominator, is up to each function; see
//! [`guarded_ratio`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;

use crate::align;
use crate::clock::{self, Clock, SystemClock};
use crate::config::{DependentVar, VariableStoreOptions, validate_period};
use crate::error::Result;
use crate::instrument::{self, InstrumentKind, InstrumentUpdate, Scalar, ValueKind};
use crate::registry::Registry;

type IntFn = dyn Fn(&VariableView<'_>) -> i64 + Send + Sync;
type FloatFn = dyn Fn(&VariableView<'_>) -> f64 + Send + Sync;

/// A dependent-variable function, tagged with the kind of value it returns.
#[derive(Clone)]
pub enum DependentFn {
    /// Returns an integer.
    Int(Arc<IntFn>),
    /// Returns a float.
    Float(Arc<FloatFn>),
}

impl DependentFn {
    /// Wraps an integer-valued function.
    pub fn int<F>(f: F) -> Self
    where
        F: Fn(&VariableView<'_>) -> i64 + Send + Sync + 'static,
    {
        Self::Int(Arc::new(f))
    }

    /// Wraps a float-valued function.
    pub fn float<F>(f: F) -> Self
    where
        F: Fn(&VariableView<'_>) -> f64 + Send + Sync + 'static,
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

    pub(crate) fn evaluate(&self, view: &VariableView<'_>) -> Scalar {
        match self {
            Self::Int(f) => Scalar::Int(f(view)),
            Self::Float(f) => Scalar::Float(f(view)),
        }
    }
}

impl fmt::Debug for DependentFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(_) => f.write_str("DependentFn::Int"),
            Self::Float(_) => f.write_str("DependentFn::Float"),
        }
    }
}

/// Read-only view of a store handed to dependent functions.
#[derive(Debug, Clone, Copy)]
pub struct VariableView<'a> {
    values: &'a HashMap<String, Scalar>,
    history: &'a HashMap<String, HashMap<String, Scalar>>,
}

impl VariableView<'_> {
    /// The current value of `key`.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        self.values.get(key).copied()
    }

    /// The current value of `key` if it is an integer.
    pub fn value_i64(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Scalar::as_i64)
    }

    /// The current value of `key` if it is a float.
    pub fn value_f64(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(Scalar::as_f64)
    }

    /// The value `key` had at `period`'s most recent boundary.
    ///
    /// `None` if the period has never rolled or `key` was unset when it did.
    pub fn value_history(&self, key: &str, period: &str) -> Option<Scalar> {
        self.history
            .get(period)
            .and_then(|bucket| bucket.get(key))
            .copied()
    }

    /// Integer form of [`value_history`](Self::value_history).
    pub fn history_i64(&self, key: &str, period: &str) -> Option<i64> {
        self.value_history(key, period).and_then(Scalar::as_i64)
    }

    /// Float form of [`value_history`](Self::value_history).
    pub fn history_f64(&self, key: &str, period: &str) -> Option<f64> {
        self.value_history(key, period).and_then(Scalar::as_f64)
    }

    /// Reports whether `period` has rolled at least once.
    pub fn has_history(&self, period: &str) -> bool {
        self.history.contains_key(period)
    }

    /// Keys with a current value, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// `num / den`, or 0 when `den` is zero or negative.
///
/// Dependent functions computing a rate over a history baseline should use
/// this (or an equivalent guard); the store publishes whatever they return.
pub fn guarded_ratio(num: f64, den: f64) -> f64 {
    if den <= 0.0 { 0.0 } else { num / den }
}

/// Independent values, aligned history, and dependent values behind one lock.
#[derive(Debug)]
pub struct VariableStore {
    prefix: String,
    min_interval: Duration,
    key_period: Duration,
    clock: Arc<dyn Clock>,
    inner: RwLock<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    latest_snapshot: DateTime<Utc>,
    values: HashMap<String, Scalar>,
    /// Period label -> copy of `values` at that period's last boundary.
    history: HashMap<String, HashMap<String, Scalar>>,
    key_kinds: BTreeMap<String, InstrumentKind>,
    dependents: BTreeMap<String, Dependent>,
    buckets: BTreeMap<String, HistoryBucket>,
}

#[derive(Debug)]
struct Dependent {
    var: DependentVar,
    last_evaluated: DateTime<Utc>,
}

#[derive(Debug)]
struct HistoryBucket {
    period: Duration,
    next_boundary: i64,
}

impl StoreState {
    fn view(&self) -> VariableView<'_> {
        VariableView {
            values: &self.values,
            history: &self.history,
        }
    }
}

impl VariableStore {
    /// Builds a store from `options`, using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if a period or a
    /// dependent variable is invalid.
    pub fn new(options: VariableStoreOptions) -> Result<Self> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Builds a store from `options`, reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_clock(options: VariableStoreOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;

        let now = clock.now();
        let local = now.with_timezone(&Local);
        let buckets = options
            .periods
            .iter()
            .map(|(label, period)| {
                let bucket = HistoryBucket {
                    period: *period,
                    next_boundary: align::next_boundary(*period, &local),
                };
                (label.clone(), bucket)
            })
            .collect();
        let min_interval = options.effective_interval();
        let key_period = options.effective_key_period();
        let dependents = options
            .dependent_vars
            .into_iter()
            .map(|(key, var)| {
                let dependent = Dependent {
                    var,
                    last_evaluated: now,
                };
                (key, dependent)
            })
            .collect();

        Ok(Self {
            min_interval,
            key_period,
            prefix: options.prefix,
            clock,
            inner: RwLock::new(StoreState {
                latest_snapshot: now,
                values: HashMap::new(),
                history: HashMap::new(),
                key_kinds: options.key_types,
                dependents,
                buckets,
            }),
        })
    }

    /// Resolves the store named `name`, building it from `options` if needed.
    ///
    /// An empty prefix in `options` is replaced by `name`. An existing store
    /// is returned unchanged and `options` are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another type or `options` are
    /// invalid.
    pub fn get_or_register(
        registry: &Registry,
        name: &str,
        mut options: VariableStoreOptions,
    ) -> Result<Arc<Self>> {
        registry.get_or_register(name, || {
            if options.prefix.is_empty() {
                options.prefix = name.to_string();
            }
            Self::new(options)
        })
    }

    /// The namespace published names start with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Sets the integer value of `key`.
    pub fn update_int64(&self, key: &str, v: i64) {
        self.update(key, Scalar::Int(v));
    }

    /// Sets the float value of `key`.
    pub fn update_float64(&self, key: &str, v: f64) {
        self.update(key, Scalar::Float(v));
    }

    /// Sets the value of `key`. Last write wins.
    pub fn update(&self, key: &str, v: Scalar) {
        self.inner.write().values.insert(key.to_string(), v);
    }

    /// The current value of `key`.
    ///
    /// Takes the shared lock; never call it from a dependent function.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        self.inner.read().view().value(key)
    }

    /// The value `key` had at `period`'s most recent boundary.
    ///
    /// Takes the shared lock; never call it from a dependent function.
    pub fn value_history(&self, key: &str, period: &str) -> Option<Scalar> {
        self.inner.read().view().value_history(key, period)
    }

    /// Keys with a current value, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().values.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Names of the dependent variables, sorted.
    pub fn dependent_keys(&self) -> Vec<String> {
        self.inner.read().dependents.keys().cloned().collect()
    }

    /// History period labels, sorted.
    pub fn periods(&self) -> Vec<String> {
        self.inner.read().buckets.keys().cloned().collect()
    }

    /// Adds history periods. Labels already present keep their schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) for the first
    /// invalid entry; nothing is added in that case.
    pub fn set_periods(&self, periods: &BTreeMap<String, Duration>) -> Result<()> {
        for (label, period) in periods {
            validate_period(label, *period)?;
        }

        let now = self.clock.now().with_timezone(&Local);
        let mut state = self.inner.write();
        for (label, period) in periods {
            state
                .buckets
                .entry(label.clone())
                .or_insert_with(|| HistoryBucket {
                    period: *period,
                    next_boundary: align::next_boundary(*period, &now),
                });
        }
        Ok(())
    }

    /// Publishes `key` as `kind` on every accepted snapshot.
    pub fn set_key_type(&self, key: &str, kind: InstrumentKind) {
        self.inner.write().key_kinds.insert(key.to_string(), kind);
    }

    /// Registers or replaces the dependent variable `key`.
    ///
    /// Replacing a definition keeps its evaluation schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KindMismatch`](crate::error::ConfigError::KindMismatch)
    /// if the function's value kind does not fit `var.kind`.
    pub fn set_dependent_var(&self, key: &str, var: DependentVar) -> Result<()> {
        var.validate(key)?;

        let now = self.clock.now();
        let mut state = self.inner.write();
        match state.dependents.get_mut(key) {
            Some(existing) => existing.var = var,
            None => {
                state.dependents.insert(
                    key.to_string(),
                    Dependent {
                        var,
                        last_evaluated: now,
                    },
                );
            }
        }
        Ok(())
    }

    /// Publishes the store into `registry` if the snapshot interval has
    /// elapsed, returning what was written.
    ///
    /// Returns `None` when throttled. An accepted snapshot returns `Some`,
    /// possibly with an empty list. Values that cannot be published (a stored
    /// scalar of the wrong kind, a name bound to another instrument type) are
    /// logged and skipped.
    pub fn snapshot(&self, registry: &Registry) -> Option<Vec<InstrumentUpdate>> {
        let now = self.clock.now();
        let mut guard = self.inner.write();

        if clock::elapsed(now, guard.latest_snapshot) < self.min_interval {
            tracing::trace!("store {} snapshot throttled", self.prefix);
            return None;
        }
        guard.latest_snapshot = now;

        let state = &mut *guard;
        let mut updates = Vec::with_capacity(state.key_kinds.len() + state.dependents.len());

        for (key, kind) in &state.key_kinds {
            let Some(value) = state.values.get(key).copied() else {
                continue;
            };
            self.publish(registry, key, *kind, value, self.key_period, &mut updates);
        }

        let view = VariableView {
            values: &state.values,
            history: &state.history,
        };
        for (key, dependent) in &mut state.dependents {
            if clock::elapsed(now, dependent.last_evaluated) < dependent.var.period {
                continue;
            }
            dependent.last_evaluated = now;

            let value = dependent.var.func.evaluate(&view);
            let gate = if dependent.var.period.is_zero() {
                self.key_period
            } else {
                dependent.var.period
            };
            self.publish(registry, key, dependent.var.kind, value, gate, &mut updates);
        }

        let now_ts = now.timestamp();
        for (label, bucket) in &mut state.buckets {
            if now_ts < bucket.next_boundary {
                continue;
            }
            state.history.insert(label.clone(), state.values.clone());

            let step = i64::try_from(bucket.period.as_secs()).unwrap_or(i64::MAX);
            bucket.next_boundary = bucket.next_boundary.saturating_add(step);
            tracing::debug!(
                "store {} history {label} rolled: next_boundary={}",
                self.prefix,
                bucket.next_boundary
            );
        }

        Some(updates)
    }

    fn publish(
        &self,
        registry: &Registry,
        key: &str,
        kind: InstrumentKind,
        value: Scalar,
        period: Duration,
        updates: &mut Vec<InstrumentUpdate>,
    ) {
        let name = format!("{}-{key}", self.prefix);
        match instrument::publish(registry, &self.clock, name, kind, value, period) {
            Ok(update) => updates.push(update),
            Err(e) => tracing::warn!("store {} failed to publish {key}: {e}", self.prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ConfigError, TallyError};
    use crate::instrument::{Counter, Gauge};

    // 2023-11-14T22:13:20Z; the next 5m boundary is 100s away.
    const START: i64 = 1_700_000_000;

    fn options() -> VariableStoreOptions {
        let mut options = VariableStoreOptions::new("app");
        options.interval = Duration::from_secs(10);
        options
            .periods
            .insert("5m".to_string(), Duration::from_secs(300));
        options
            .key_types
            .insert("online".to_string(), InstrumentKind::Gauge);
        options
    }

    fn store(options: VariableStoreOptions) -> (Arc<ManualClock>, VariableStore) {
        let clock = Arc::new(ManualClock::from_unix(START));
        let store = VariableStore::with_clock(options, clock.clone()).unwrap();
        (clock, store)
    }

    fn find<'a>(updates: &'a [InstrumentUpdate], name: &str) -> Option<&'a InstrumentUpdate> {
        updates.iter().find(|u| u.name == name)
    }

    #[test]
    fn test_guarded_ratio() {
        assert_eq!(guarded_ratio(1.0, 4.0), 0.25);
        assert_eq!(guarded_ratio(1.0, 0.0), 0.0);
        assert_eq!(guarded_ratio(1.0, -2.0), 0.0);
    }

    #[test]
    fn test_dependent_fn_kind() {
        assert_eq!(DependentFn::int(|_| 1).value_kind(), ValueKind::Int);
        assert_eq!(DependentFn::float(|_| 1.0).value_kind(), ValueKind::Float);
        assert_eq!(format!("{:?}", DependentFn::int(|_| 1)), "DependentFn::Int");
    }

    #[test]
    fn test_update_last_write_wins() {
        let (_clock, store) = store(options());
        store.update_int64("online", 1);
        store.update_int64("online", 2);
        store.update_float64("ratio", 0.5);

        assert_eq!(store.value("online"), Some(Scalar::Int(2)));
        assert_eq!(store.value("ratio"), Some(Scalar::Float(0.5)));
        assert_eq!(store.value("missing"), None);
        assert_eq!(store.keys(), vec!["online".to_string(), "ratio".to_string()]);
    }

    #[test]
    fn test_snapshot_throttle() {
        let (clock, store) = store(options());
        let registry = Registry::new();

        assert!(store.snapshot(&registry).is_none());
        clock.advance(Duration::from_secs(9));
        assert!(store.snapshot(&registry).is_none());

        clock.advance(Duration::from_secs(1));
        let updates = store.snapshot(&registry);
        assert_eq!(updates.map(|u| u.len()), Some(0));

        assert!(store.snapshot(&registry).is_none());
    }

    #[test]
    fn test_snapshot_publishes_with_prefix() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store.update_int64("online", 42);
        store.update_int64("unrouted", 7);

        clock.advance(Duration::from_secs(10));
        let updates = store.snapshot(&registry).unwrap();

        assert_eq!(updates.len(), 1);
        let update = find(&updates, "app-online").unwrap();
        assert_eq!(update.kind, InstrumentKind::Gauge);
        assert_eq!(update.value, Scalar::Int(42));
        assert_eq!(registry.get::<Gauge>("app-online").unwrap().value(), 42);
        assert!(!registry.contains("app-unrouted"));
    }

    #[test]
    fn test_kind_mismatch_is_skipped() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store.update_float64("online", 0.5);

        clock.advance(Duration::from_secs(10));
        let updates = store.snapshot(&registry).unwrap();
        assert!(updates.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_history_absent_until_boundary() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store.update_int64("online", 10);

        clock.advance(Duration::from_secs(10));
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), None);

        // START + 100 is the first 5m boundary.
        clock.set(DateTime::from_timestamp(START + 100, 0).unwrap());
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(10)));

        // History is a frozen copy.
        store.update_int64("online", 20);
        clock.advance(Duration::from_secs(10));
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(10)));
    }

    #[test]
    fn test_history_rolls_one_period_per_snapshot() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store.update_int64("online", 1);

        // Stall across three boundaries.
        clock.set(DateTime::from_timestamp(START + 100 + 600, 0).unwrap());
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(1)));

        store.update_int64("online", 2);
        clock.advance(Duration::from_secs(10));
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(2)));

        store.update_int64("online", 3);
        clock.advance(Duration::from_secs(10));
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(3)));

        // Caught up: START + 1000 is the next boundary.
        store.update_int64("online", 4);
        clock.advance(Duration::from_secs(10));
        store.snapshot(&registry).unwrap();
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(3)));
    }

    #[test]
    fn test_dependent_sees_history_before_roll() {
        let mut options = options();
        options.dependent_vars.insert(
            "online-delta".to_string(),
            DependentVar::new(
                DependentFn::int(|v| {
                    let now = v.value_i64("online").unwrap_or(0);
                    now - v.history_i64("online", "5m").unwrap_or(0)
                }),
                InstrumentKind::Counter,
                Duration::ZERO,
            ),
        );
        let (clock, store) = store(options);
        let registry = Registry::new();

        store.update_int64("online", 30);
        clock.set(DateTime::from_timestamp(START + 100, 0).unwrap());
        let updates = store.snapshot(&registry).unwrap();
        assert_eq!(find(&updates, "app-online-delta").unwrap().value, Scalar::Int(30));

        store.update_int64("online", 45);
        clock.advance(Duration::from_secs(10));
        let updates = store.snapshot(&registry).unwrap();
        assert_eq!(find(&updates, "app-online-delta").unwrap().value, Scalar::Int(15));
        assert_eq!(registry.get::<Counter>("app-online-delta").unwrap().count(), 15);
    }

    #[test]
    fn test_dependent_own_period() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store
            .set_dependent_var(
                "has-history",
                DependentVar::new(
                    DependentFn::int(|v| i64::from(v.has_history("5m"))),
                    InstrumentKind::Gauge,
                    Duration::from_secs(30),
                ),
            )
            .unwrap();
        assert_eq!(store.dependent_keys(), vec!["has-history".to_string()]);

        let mut evaluated = 0;
        for _ in 0..6 {
            clock.advance(Duration::from_secs(10));
            let updates = store.snapshot(&registry).unwrap();
            if find(&updates, "app-has-history").is_some() {
                evaluated += 1;
            }
        }
        // 60 seconds at a 30 second period.
        assert_eq!(evaluated, 2);
    }

    #[test]
    fn test_conditional_key_shares_gate_period() {
        let mut options = options();
        options.key_period = Some(Duration::from_secs(30));
        options
            .key_types
            .insert("online".to_string(), InstrumentKind::ConditionalInt);
        let (clock, store) = store(options);
        let registry = Registry::new();
        store.update_int64("online", 5);

        clock.advance(Duration::from_secs(10));
        let updates = store.snapshot(&registry).unwrap();
        assert!(!find(&updates, "app-online").unwrap().is_writable());

        clock.advance(Duration::from_secs(30));
        let updates = store.snapshot(&registry).unwrap();
        assert!(find(&updates, "app-online").unwrap().is_writable());
    }

    #[test]
    fn test_set_dependent_var_rejects_kind_mismatch() {
        let (_clock, store) = store(options());
        let result = store.set_dependent_var(
            "ratio",
            DependentVar::new(
                DependentFn::float(|_| 0.5),
                InstrumentKind::Gauge,
                Duration::ZERO,
            ),
        );
        assert!(matches!(
            result,
            Err(TallyError::Config(ConfigError::KindMismatch { .. }))
        ));
        assert!(store.dependent_keys().is_empty());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut options = options();
        options.periods.insert("bad".to_string(), Duration::ZERO);
        let clock = Arc::new(ManualClock::from_unix(START));
        assert!(VariableStore::with_clock(options, clock).is_err());
    }

    #[test]
    fn test_set_periods_keeps_existing_schedule() {
        let (clock, store) = store(options());
        let registry = Registry::new();
        store.update_int64("online", 1);

        clock.set(DateTime::from_timestamp(START + 100, 0).unwrap());
        store.snapshot(&registry).unwrap();

        let mut more = BTreeMap::new();
        more.insert("5m".to_string(), Duration::from_secs(60));
        more.insert("1m".to_string(), Duration::from_secs(60));
        store.set_periods(&more).unwrap();

        assert_eq!(store.periods(), vec!["1m".to_string(), "5m".to_string()]);
        assert_eq!(store.value_history("online", "5m"), Some(Scalar::Int(1)));
        assert_eq!(store.value_history("online", "1m"), None);
    }

    #[test]
    fn test_get_or_register_defaults_prefix() {
        let registry = Registry::new();
        let mut options = options();
        options.prefix = String::new();

        let store = VariableStore::get_or_register(&registry, "sessions", options).unwrap();
        assert_eq!(store.prefix(), "sessions");

        let again =
            VariableStore::get_or_register(&registry, "sessions", VariableStoreOptions::default())
                .unwrap();
        assert!(Arc::ptr_eq(&store, &again));
    }
}
