//! Error types for the tally telemetry value store.

use std::time::Duration;

use thiserror::Error;

use crate::instrument::ValueKind;

/// The main error type for all tally operations.
///
/// Every error is raised at wiring time (construction, registration,
/// configuration loading). Runtime operations such as updates, reads and
/// snapshots never fail; missing data is reported through `Option`.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error in instrument or store configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error while looking up or registering a named instrument.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors that can occur while configuring an instrument or a store.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A window or history period is unusable.
    #[error("invalid period '{label}' ({period:?}): {reason}")]
    InvalidPeriod {
        /// The label the period was registered under.
        label: String,
        /// The rejected duration.
        period: Duration,
        /// Why the period was rejected.
        reason: String,
    },

    /// A period was registered under an empty label.
    #[error("period label cannot be empty")]
    EmptyLabel,

    /// A dependent function produces a value kind its instrument cannot hold.
    #[error("dependent variable '{key}' produces {found} values but its instrument expects {expected}")]
    KindMismatch {
        /// The dependent variable key.
        key: String,
        /// The value kind the instrument kind requires.
        expected: ValueKind,
        /// The value kind the function produces.
        found: ValueKind,
    },

    /// Failed to read an options file.
    #[error("failed to read options from '{}': {source}", path.display())]
    Read {
        /// The options file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse options from JSON.
    #[error("failed to parse options: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors that can occur when resolving a named instrument.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The name is already bound to an instrument of another type.
    #[error("instrument '{name}' is already registered with a type other than {expected}")]
    TypeMismatch {
        /// The contested instrument name.
        name: String,
        /// The type the caller asked for.
        expected: &'static str,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
