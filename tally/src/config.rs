//! Configuration types for variable stores and windowed instruments.
//!
//! [`VariableStoreOptions`] is the construction record for a
//! [`VariableStore`](crate::variables::VariableStore). Everything except the
//! dependent-variable functions is serde-serializable, so the static part of a
//! store (prefix, cadence, history periods, key routing) can live in a JSON
//! file while the functions are attached in code.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tally::config::{DependentVar, VariableStoreOptions};
//! use tally::instrument::InstrumentKind;
//! use tally::variables::DependentFn;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut options = VariableStoreOptions::from_json(r#"{
//!     "prefix": "sessions",
//!     "interval": 2.0,
//!     "periods": { "5m": 300.0 },
//!     "key_types": { "online": "conditional_int" }
//! }"#)?;
//!
//! options.dependent_vars.insert(
//!     "online-5m".to_string(),
//!     DependentVar::new(
//!         DependentFn::int(|v| {
//!             let now = v.value_i64("online").unwrap_or(0);
//!             now - v.history_i64("online", "5m").unwrap_or(0)
//!         }),
//!         InstrumentKind::ConditionalInt,
//!         Duration::from_secs(300),
//!     ),
//! );
//! options.validate()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::instrument::InstrumentKind;
use crate::variables::DependentFn;

/// Snapshot throttle used when [`VariableStoreOptions::interval`] is zero.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest period a window or history bucket may use.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Construction options for a variable store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableStoreOptions {
    /// Namespace prepended to every published instrument name (`prefix-key`).
    ///
    /// When empty, the registry name the store is registered under is used.
    pub prefix: String,

    /// Minimum time between accepted snapshots. Zero selects
    /// [`DEFAULT_INTERVAL`].
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// History periods, keyed by label. Each period keeps a full copy of the
    /// independent values taken at its most recent aligned boundary.
    #[serde(with = "duration_map_serde")]
    pub periods: BTreeMap<String, Duration>,

    /// Write gate of the conditional instruments independent keys publish
    /// into. Defaults to the effective interval.
    #[serde(with = "option_duration_serde")]
    pub key_period: Option<Duration>,

    /// Independent keys to publish, and the instrument kind of each.
    pub key_types: BTreeMap<String, InstrumentKind>,

    /// Dependent variables, keyed by the name they publish under.
    #[serde(skip)]
    pub dependent_vars: BTreeMap<String, DependentVar>,
}

impl VariableStoreOptions {
    /// Creates empty options under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Parses options from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e).into())
    }

    /// Reads options from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if it is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    /// Validates every period and dependent variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid entry.
    pub fn validate(&self) -> Result<()> {
        for (label, period) in &self.periods {
            validate_period(label, *period)?;
        }
        for (key, var) in &self.dependent_vars {
            var.validate(key)?;
        }
        Ok(())
    }

    /// The snapshot throttle with the zero default applied.
    pub fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            self.interval
        }
    }

    /// The independent-key write gate with its default applied.
    pub fn effective_key_period(&self) -> Duration {
        match self.key_period {
            Some(period) if !period.is_zero() => period,
            _ => self.effective_interval(),
        }
    }
}

/// A value derived from a store's current and historical state.
#[derive(Debug, Clone)]
pub struct DependentVar {
    /// Computes the value from a consistent view of the store.
    pub func: DependentFn,
    /// Instrument the value is published into.
    pub kind: InstrumentKind,
    /// Minimum time between evaluations. Zero evaluates on every accepted
    /// snapshot.
    pub period: Duration,
}

impl DependentVar {
    /// Creates a dependent variable definition.
    pub fn new(func: DependentFn, kind: InstrumentKind, period: Duration) -> Self {
        Self { func, kind, period }
    }

    /// Checks that the function's value kind fits the instrument kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KindMismatch`] otherwise.
    pub fn validate(&self, key: &str) -> Result<()> {
        let expected = self.kind.value_kind();
        let found = self.func.value_kind();
        if expected != found {
            return Err(ConfigError::KindMismatch {
                key: key.to_string(),
                expected,
                found,
            }
            .into());
        }
        Ok(())
    }
}

/// Checks that `period` can drive an aligned window.
///
/// # Errors
///
/// Returns [`ConfigError::EmptyLabel`] for an empty label, or
/// [`ConfigError::InvalidPeriod`] for periods shorter than [`MIN_PERIOD`] or
/// not a whole number of seconds.
pub fn validate_period(label: &str, period: Duration) -> Result<()> {
    if label.is_empty() {
        return Err(ConfigError::EmptyLabel.into());
    }

    if period.is_zero() {
        return Err(ConfigError::InvalidPeriod {
            label: label.to_string(),
            period,
            reason: "period cannot be zero".to_string(),
        }
        .into());
    }

    if period < MIN_PERIOD {
        return Err(ConfigError::InvalidPeriod {
            label: label.to_string(),
            period,
            reason: format!("period must be at least {MIN_PERIOD:?}"),
        }
        .into());
    }

    if period.subsec_nanos() != 0 {
        return Err(ConfigError::InvalidPeriod {
            label: label.to_string(),
            period,
            reason: "period must be a whole number of seconds".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}

mod option_duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|seconds| Duration::try_from_secs_f64(seconds).map_err(D::Error::custom))
            .transpose()
    }
}

mod duration_map_serde {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(
        periods: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        periods
            .iter()
            .map(|(label, d)| (label, d.as_secs_f64()))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, f64>::deserialize(deserializer)?
            .into_iter()
            .map(|(label, seconds)| {
                Duration::try_from_secs_f64(seconds)
                    .map(|d| (label, d))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
