//! Scalar values, instrument kinds, and the update descriptors snapshots produce.
//!
//! A [`VariableStore`](crate::variables::VariableStore) does not export
//! anything itself. Each accepted snapshot resolves one named instrument per
//! published key in a [`Registry`], pushes the current value into it, and
//! hands back an [`InstrumentUpdate`] describing what was written. Exporters
//! route on [`InstrumentKind`] and read [`Scalar`] values without locking.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::conditional::{ConditionalFloat, ConditionalInt};
use crate::error::Result;
use crate::registry::Registry;

/// The two value kinds an instrument can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int64"),
            Self::Float => f.write_str("float64"),
        }
    }
}

/// A single measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// An integer measurement.
    Int(i64),
    /// A floating point measurement.
    Float(f64),
}

impl Scalar {
    /// Returns the kind of this value.
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
        }
    }

    /// Returns the zero value of `kind`.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Self::Int(0),
            ValueKind::Float => Self::Float(0.0),
        }
    }

    /// Returns the integer, or `None` if this is a float.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            Self::Float(_) => None,
        }
    }

    /// Returns the float, or `None` if this is an integer.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(v),
            Self::Int(_) => None,
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// The instrument a published value is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// A plain counter holding the latest value.
    Counter,
    /// An integer gauge.
    Gauge,
    /// A float gauge.
    GaugeFloat,
    /// An integer value behind a write gate.
    ConditionalInt,
    /// A float value behind a write gate.
    ConditionalFloat,
}

impl InstrumentKind {
    /// Returns the value kind instruments of this kind hold.
    pub fn value_kind(self) -> ValueKind {
        match self {
            Self::Counter | Self::Gauge | Self::ConditionalInt => ValueKind::Int,
            Self::GaugeFloat | Self::ConditionalFloat => ValueKind::Float,
        }
    }
}

/// A plain integer counter.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicI64,
}

impl Counter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the counter named `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another instrument type.
    pub fn get_or_register(registry: &Registry, name: &str) -> Result<Arc<Self>> {
        registry.get_or_register(name, || Ok(Self::new()))
    }

    /// Adds `delta`, wrapping on overflow.
    pub fn inc(&self, delta: i64) {
        self.count.fetch_add(delta, Ordering::Relaxed);
    }

    /// Replaces the count.
    pub fn set(&self, v: i64) {
        self.count.store(v, Ordering::Relaxed);
    }

    /// Resets the counter to zero.
    pub fn clear(&self) {
        self.set(0);
    }

    /// Returns the current count.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// An integer gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Creates a gauge at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the gauge named `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another instrument type.
    pub fn get_or_register(registry: &Registry, name: &str) -> Result<Arc<Self>> {
        registry.get_or_register(name, || Ok(Self::new()))
    }

    /// Replaces the value.
    pub fn update(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A float gauge, stored as raw bits.
#[derive(Debug, Default)]
pub struct GaugeFloat {
    bits: AtomicU64,
}

impl GaugeFloat {
    /// Creates a gauge at `0.0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the float gauge named `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is bound to another instrument type.
    pub fn get_or_register(registry: &Registry, name: &str) -> Result<Arc<Self>> {
        registry.get_or_register(name, || Ok(Self::new()))
    }

    /// Replaces the value.
    pub fn update(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// A shared handle to a registered instrument.
#[derive(Debug, Clone)]
pub enum InstrumentHandle {
    /// A plain counter.
    Counter(Arc<Counter>),
    /// An integer gauge.
    Gauge(Arc<Gauge>),
    /// A float gauge.
    GaugeFloat(Arc<GaugeFloat>),
    /// A gated integer.
    ConditionalInt(Arc<ConditionalInt>),
    /// A gated float.
    ConditionalFloat(Arc<ConditionalFloat>),
}

/// One value published by a store snapshot.
///
/// `name` is the namespaced key (`prefix-key`). The handle is skipped when
/// serializing; everything an exporter needs to route and persist the value
/// is in the other fields.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentUpdate {
    /// Namespaced instrument name.
    pub name: String,
    /// Instrument kind the value was routed to.
    pub kind: InstrumentKind,
    /// Value written into the instrument.
    pub value: Scalar,
    /// The instrument itself.
    #[serde(skip)]
    pub instrument: InstrumentHandle,
}

impl InstrumentUpdate {
    /// Reports whether the instrument is due for persistence.
    ///
    /// Plain kinds are always writable. Conditional kinds consult their gate
    /// without advancing it.
    pub fn is_writable(&self) -> bool {
        match &self.instrument {
            InstrumentHandle::ConditionalInt(c) => c.writable(),
            InstrumentHandle::ConditionalFloat(c) => c.writable(),
            _ => true,
        }
    }

    /// Marks the value as persisted, advancing the gate of conditional kinds.
    ///
    /// Returns whether the value was due. Plain kinds always are.
    pub fn accept(&self) -> bool {
        match &self.instrument {
            InstrumentHandle::ConditionalInt(c) => c.snapshot().writable(),
            InstrumentHandle::ConditionalFloat(c) => c.snapshot().writable(),
            _ => true,
        }
    }
}

/// Resolves `name` in the registry as `kind`, writes `value` into it, and
/// describes the write.
///
/// Conditional instruments created here gate on `period` and share `clock`.
/// The value kind must already match `kind`.
pub(crate) fn publish(
    registry: &Registry,
    clock: &Arc<dyn Clock>,
    name: String,
    kind: InstrumentKind,
    value: Scalar,
    period: Duration,
) -> Result<InstrumentUpdate> {
    let instrument = match (kind, value) {
        (InstrumentKind::Counter, Scalar::Int(v)) => {
            let counter = Counter::get_or_register(registry, &name)?;
            counter.set(v);
            InstrumentHandle::Counter(counter)
        }
        (InstrumentKind::Gauge, Scalar::Int(v)) => {
            let gauge = Gauge::get_or_register(registry, &name)?;
            gauge.update(v);
            InstrumentHandle::Gauge(gauge)
        }
        (InstrumentKind::GaugeFloat, Scalar::Float(v)) => {
            let gauge = GaugeFloat::get_or_register(registry, &name)?;
            gauge.update(v);
            InstrumentHandle::GaugeFloat(gauge)
        }
        (InstrumentKind::ConditionalInt, Scalar::Int(v)) => {
            let cond = registry.get_or_register(&name, || {
                Ok(ConditionalInt::with_clock(period, Arc::clone(clock)))
            })?;
            cond.update(v);
            InstrumentHandle::ConditionalInt(cond)
        }
        (InstrumentKind::ConditionalFloat, Scalar::Float(v)) => {
            let cond = registry.get_or_register(&name, || {
                Ok(ConditionalFloat::with_clock(period, Arc::clone(clock)))
            })?;
            cond.update(v);
            InstrumentHandle::ConditionalFloat(cond)
        }
        (kind, value) => {
            return Err(crate::error::ConfigError::KindMismatch {
                key: name,
                expected: kind.value_kind(),
                found: value.kind(),
            }
            .into());
        }
    };

    Ok(InstrumentUpdate {
        name,
        kind,
        value,
        instrument,
    })
}
