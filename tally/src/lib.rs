//! # tally
//!
//! In-process telemetry value store.
//!
//! tally tracks scalar measurements contributed by an application, computes
//! deltas and rates over clock-aligned windows, and derives secondary values
//! from primary values and their history. An exporter loop drives it by
//! taking snapshots on its own cadence; nothing in the crate spawns threads
//! or schedules timers.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Window boundaries align to the wall clock, so every process reporting a
//!   5m window agrees on where it starts
//! - Snapshots are throttled; calling them too often is a cheap no-op
//! - Dependent functions see one consistent instant of a store's values and
//!   history
//! - Configuration errors are returned, never panicked
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tally::{
//!     DependentFn, DependentVar, InstrumentKind, Registry, RollingWindowCounter,
//!     VariableStore, VariableStoreOptions,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new();
//!
//! // A counter reporting per-minute and per-5-minute deltas
//! let requests = RollingWindowCounter::get_or_register(
//!     &registry,
//!     "requests",
//!     &tally::align::standard_windows(),
//! )?;
//! requests.inc(1);
//!
//! // A store with one independent key and one derived value
//! let mut options = VariableStoreOptions::new("sessions");
//! options.interval = Duration::from_secs(10);
//! options.key_types.insert("online".into(), InstrumentKind::Gauge);
//! options.dependent_vars.insert(
//!     "online-doubled".into(),
//!     DependentVar::new(
//!         DependentFn::int(|v| v.value_i64("online").unwrap_or(0) * 2),
//!         InstrumentKind::Gauge,
//!         Duration::ZERO,
//!     ),
//! );
//! let store = VariableStore::get_or_register(&registry, "sessions", options)?;
//! store.update_int64("online", 21);
//!
//! // Called from the exporter loop; `None` until the interval has elapsed
//! if let Some(updates) = store.snapshot(&registry) {
//!     for update in updates {
//!         println!("{} = {}", update.name, update.value);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RollingWindowCounter`] - Running total plus aligned per-window deltas
//! - [`ConditionalValue`] - Scalar with a once-per-period "writable" gate
//! - [`VariableStore`] - Independent values, aligned history, dependent values
//! - [`KeyedGauge`] - Flat value map with one step of lookback
//! - [`Registry`] - Explicit get-or-register namespace for all of the above
//!
//! ## Modules
//!
//! - [`align`] - Aligned boundary computation
//! - [`clock`] - Time sources
//! - [`conditional`] - Write-gated values
//! - [`config`] - Store options and period validation
//! - [`gauge_map`] - Keyed gauge
//! - [`instrument`] - Scalars, instrument kinds, snapshot update descriptors
//! - [`registry`] - Named instrument registry
//! - [`variables`] - Variable store and dependent functions
//! - [`window`] - Rolling window counter
//! - [`error`] - Error types

pub mod align;
pub mod clock;
pub mod conditional;
pub mod config;
pub mod error;
pub mod gauge_map;
pub mod instrument;
pub mod registry;
pub mod variables;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditional::{ConditionalFloat, ConditionalInt, ConditionalSnapshot, ConditionalValue};
pub use config::{DependentVar, VariableStoreOptions};
pub use error::{ConfigError, RegistryError, Result, TallyError};
pub use gauge_map::{GaugeFn, GaugeMapSnapshot, KeyedGauge};
pub use instrument::{InstrumentKind, InstrumentUpdate, Scalar, ValueKind};
pub use registry::Registry;
pub use variables::{DependentFn, VariableStore, VariableView, guarded_ratio};
pub use window::{RollingWindowCounter, RollingWindowSnapshot, WindowRate};
