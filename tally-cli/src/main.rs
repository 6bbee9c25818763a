//! CLI for the tally telemetry value store.
//!
//! Provides commands for inspecting window alignment and for replaying a
//! synthetic workload through windowed counters and variable stores.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tally::align;
use tally::clock::{Clock, ManualClock};
use tally::config::{DependentVar, VariableStoreOptions, validate_period};
use tally::instrument::{InstrumentKind, Scalar};
use tally::registry::Registry;
use tally::variables::{DependentFn, VariableStore, guarded_ratio};
use tally::window::RollingWindowCounter;
use tracing_subscriber::EnvFilter;

/// tally: in-process telemetry value store CLI.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Print the next aligned boundary for each window width.
    Align {
        /// Window widths (e.g., "1m", "5m", "1d").
        #[arg(required = true)]
        durations: Vec<String>,

        /// Reference time as unix seconds. Defaults to now.
        #[arg(long)]
        at: Option<i64>,
    },

    /// Replay a synthetic workload on a simulated clock and print every
    /// accepted snapshot.
    Simulate {
        /// JSON file with variable store options.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of simulated ticks.
        #[arg(long, default_value = "900")]
        ticks: u64,

        /// Simulated time between ticks (e.g., "1s", "1m").
        #[arg(long, default_value = "1s")]
        step: String,

        /// Simulated start time as unix seconds. Defaults to now.
        #[arg(long)]
        start: Option<i64>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Output format for simulation results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

/// One published value.
#[derive(Serialize)]
struct Row {
    timestamp: i64,
    name: String,
    kind: &'static str,
    value: Scalar,
    writable: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Align { durations, at } => cmd_align(&durations, at),
        Commands::Simulate {
            config,
            ticks,
            step,
            start,
            format,
        } => cmd_simulate(config.as_deref(), ticks, &step, start, &format),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Implements `tally align <durations...>`.
fn cmd_align(durations: &[String], at: Option<i64>) -> Result<(), Box<dyn std::error::Error>> {
    let now = match at {
        Some(secs) => Local
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| format!("Invalid timestamp: {secs}"))?,
        None => Local::now(),
    };

    println!("# now={} ({})", now.timestamp(), now.to_rfc3339());
    println!("window,seconds,boundary,boundary_local,wait_seconds");
    for label in durations {
        let period = parse_duration(label)?;
        validate_period(label, period)?;

        let boundary = align::next_boundary(period, &now);
        let local = Local
            .timestamp_opt(boundary, 0)
            .single()
            .map_or_else(|| "?".to_string(), |t| t.to_rfc3339());
        println!(
            "{},{},{boundary},{local},{}",
            format_duration_secs(period.as_secs()),
            period.as_secs(),
            boundary - now.timestamp()
        );
    }

    Ok(())
}

/// Implements `tally simulate`.
fn cmd_simulate(
    config: Option<&Path>,
    ticks: u64,
    step: &str,
    start: Option<i64>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let step = parse_duration(step)?;
    let start = start.unwrap_or_else(|| Utc::now().timestamp());
    let clock = Arc::new(ManualClock::from_unix(start));
    let registry = Registry::new();

    let options = match config {
        Some(path) => VariableStoreOptions::load(path)?,
        None => default_options(),
    };
    let options = with_workload_vars(options);
    let windows = if options.periods.is_empty() {
        align::standard_windows()
    } else {
        options.periods.clone()
    };

    let requests = RollingWindowCounter::with_clock(clock.clone());
    requests.set_periods(windows)?;
    let store = VariableStore::with_clock(options, clock.clone())?;

    tracing::info!(
        "simulating {ticks} ticks of {} from {start} (store {})",
        format_duration_secs(step.as_secs()),
        store.prefix()
    );

    let mut rows = Vec::new();
    for tick in 0..ticks {
        let arrivals = i64::try_from(tick % 7).unwrap_or(0) + 1;
        requests.inc(arrivals);
        store.update_int64("requests", requests.count());
        store.update_int64("inflight", i64::try_from(tick % 13).unwrap_or(0));

        clock.advance(step);
        let timestamp = clock.now().timestamp();

        let snap = requests.snapshot();
        if snap.writable() {
            for label in snap.periods() {
                let Some(rate) = snap.latest_period_count_rate(&label) else {
                    continue;
                };
                rows.push(Row {
                    timestamp,
                    name: format!("requests.{label}.delta"),
                    kind: "window",
                    value: Scalar::Int(rate.delta),
                    writable: true,
                });
                rows.push(Row {
                    timestamp,
                    name: format!("requests.{label}.rate"),
                    kind: "window",
                    value: Scalar::Float(rate.rate),
                    writable: true,
                });
            }
        }

        if let Some(updates) = store.snapshot(&registry) {
            for update in updates {
                let writable = update.accept();
                rows.push(Row {
                    timestamp,
                    name: update.name,
                    kind: kind_name(update.kind),
                    value: update.value,
                    writable,
                });
            }
        }
    }

    tracing::info!("{} rows from {} instruments", rows.len(), registry.len());

    match format {
        OutputFormat::Csv => {
            println!("timestamp,name,kind,value,writable");
            for row in &rows {
                println!(
                    "{},{},{},{},{}",
                    row.timestamp, row.name, row.kind, row.value, row.writable
                );
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "start": start,
                "ticks": ticks,
                "step_seconds": step.as_secs_f64(),
                "count": rows.len(),
                "data": rows,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Store options used when no config file is given.
fn default_options() -> VariableStoreOptions {
    let mut options = VariableStoreOptions::new("sim");
    options.interval = Duration::from_secs(10);
    options.periods = [
        (align::LABEL_1M, align::MINUTE),
        (align::LABEL_5M, align::FIVE_MINUTES),
    ]
    .into_iter()
    .map(|(label, period)| (label.to_string(), period))
    .collect::<BTreeMap<_, _>>();
    options.key_period = Some(Duration::from_secs(30));
    options
        .key_types
        .insert("requests".to_string(), InstrumentKind::Counter);
    options
        .key_types
        .insert("inflight".to_string(), InstrumentKind::ConditionalInt);
    options
}

/// Adds one delta and one rate per history period for the `requests` key.
///
/// Functions cannot live in a JSON file, so they are always attached here.
#[allow(clippy::cast_precision_loss)] // display-only rates
fn with_workload_vars(mut options: VariableStoreOptions) -> VariableStoreOptions {
    for (label, period) in options.periods.clone() {
        let delta_label = label.clone();
        options.dependent_vars.insert(
            format!("requests-{label}"),
            DependentVar::new(
                DependentFn::int(move |v| {
                    let now = v.value_i64("requests").unwrap_or(0);
                    now - v.history_i64("requests", &delta_label).unwrap_or(now)
                }),
                InstrumentKind::Gauge,
                Duration::ZERO,
            ),
        );

        let rate_label = label.clone();
        let secs = period.as_secs_f64();
        options.dependent_vars.insert(
            format!("requests-rate-{label}"),
            DependentVar::new(
                DependentFn::float(move |v| {
                    let Some(base) = v.history_i64("requests", &rate_label) else {
                        return 0.0;
                    };
                    let now = v.value_i64("requests").unwrap_or(0);
                    guarded_ratio((now - base) as f64, secs)
                }),
                InstrumentKind::GaugeFloat,
                period,
            ),
        );
    }
    options
}

fn kind_name(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Counter => "counter",
        InstrumentKind::Gauge => "gauge",
        InstrumentKind::GaugeFloat => "gauge_float",
        InstrumentKind::ConditionalInt => "conditional_int",
        InstrumentKind::ConditionalFloat => "conditional_float",
    }
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }
    if !s.is_ascii() {
        return Err(format!("Invalid duration: '{s}'").into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(3600),
        "d" => num.checked_mul(86_400),
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    secs.map(Duration::from_secs)
        .ok_or_else(|| format!("Duration too large: '{s}'").into())
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86_400 && secs.is_multiple_of(86_400) {
        format!("{}d", secs / 86_400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("15m").unwrap(), align::FIFTEEN_MINUTES);
        assert_eq!(parse_duration(" 1h ").unwrap(), align::HOUR);
        assert_eq!(parse_duration("1d").unwrap(), align::DAY);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("xm").is_err());
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(86_400), "1d");
        assert_eq!(format_duration_secs(7200), "2h");
        assert_eq!(format_duration_secs(300), "5m");
        assert_eq!(format_duration_secs(90), "90s");
    }

    #[test]
    fn test_workload_vars_follow_periods() {
        let options = with_workload_vars(default_options());
        assert!(options.validate().is_ok());
        assert!(options.dependent_vars.contains_key("requests-5m"));
        assert!(options.dependent_vars.contains_key("requests-rate-1m"));
        assert_eq!(options.dependent_vars.len(), 4);
    }

    #[test]
    fn test_simulation_publishes_every_key() {
        let clock = Arc::new(ManualClock::from_unix(1_700_000_000));
        let registry = Registry::new();
        let store =
            VariableStore::with_clock(with_workload_vars(default_options()), clock.clone())
                .unwrap();

        store.update_int64("requests", 10);
        store.update_int64("inflight", 2);
        clock.advance(Duration::from_secs(60));

        let updates = store.snapshot(&registry).unwrap();
        let names: Vec<&str> = updates.iter().map(|u| u.name.as_str()).collect();
        assert!(names.contains(&"sim-requests"));
        assert!(names.contains(&"sim-inflight"));
        assert!(names.contains(&"sim-requests-5m"));
        assert!(names.contains(&"sim-requests-rate-1m"));
    }
}
