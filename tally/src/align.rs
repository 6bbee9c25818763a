//! Clock alignment of report boundaries.
//!
//! Windows report at "natural" instants so that independent processes agree
//! on window edges regardless of when they started: a 5 minute window rolls
//! at :00, :05, :10, ... and a day window rolls at local midnight.
//!
//! | Period                     | Next boundary                               |
//! |----------------------------|---------------------------------------------|
//! | shorter than a minute      | next whole second                           |
//! | 5m, 15m, 30m, 1h           | next multiple of the period since the epoch |
//! | 1d                         | next local-calendar midnight                |
//! | anything else              | next whole minute                           |
//!
//! The boundary is always strictly after `now`, even when `now` is itself
//! aligned.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone};

/// One minute.
pub const MINUTE: Duration = Duration::from_secs(60);
/// Five minutes.
pub const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);
/// Fifteen minutes.
pub const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
/// Thirty minutes.
pub const THIRTY_MINUTES: Duration = Duration::from_secs(30 * 60);
/// One hour.
pub const HOUR: Duration = Duration::from_secs(3600);
/// One day.
pub const DAY: Duration = Duration::from_secs(86_400);

/// Label of the one minute window.
pub const LABEL_1M: &str = "1m";
/// Label of the five minute window.
pub const LABEL_5M: &str = "5m";
/// Label of the fifteen minute window.
pub const LABEL_15M: &str = "15m";
/// Label of the thirty minute window.
pub const LABEL_30M: &str = "30m";
/// Label of the one hour window.
pub const LABEL_1H: &str = "1h";
/// Label of the one day window.
pub const LABEL_1D: &str = "1d";

const DAY_SECS: i64 = 86_400;

/// Returns the six well-known windows keyed by their labels.
pub fn standard_windows() -> BTreeMap<String, Duration> {
    [
        (LABEL_1M, MINUTE),
        (LABEL_5M, FIVE_MINUTES),
        (LABEL_15M, FIFTEEN_MINUTES),
        (LABEL_30M, THIRTY_MINUTES),
        (LABEL_1H, HOUR),
        (LABEL_1D, DAY),
    ]
    .into_iter()
    .map(|(label, period)| (label.to_string(), period))
    .collect()
}

/// Returns the epoch modulus (in seconds) a period aligns to.
///
/// Returns `None` for [`DAY`], which aligns to the calendar instead.
pub fn alignment_modulus(period: Duration) -> Option<i64> {
    if period == DAY {
        return None;
    }

    let modulus = if period == FIVE_MINUTES
        || period == FIFTEEN_MINUTES
        || period == THIRTY_MINUTES
        || period == HOUR
    {
        i64::try_from(period.as_secs()).unwrap_or(60)
    } else if period < MINUTE {
        1
    } else {
        60
    };

    Some(modulus)
}

/// Computes the next aligned boundary (unix seconds) for `period` after `now`.
///
/// The day boundary is midnight of the following calendar day in `now`'s
/// timezone. If that midnight does not exist (a DST gap), the first valid
/// instant of the following hour is used.
///
/// # Examples
///
/// ```rust
/// use chrono::DateTime;
/// use tally::align::{next_boundary, FIVE_MINUTES};
///
/// let now = DateTime::from_timestamp(1_700_000_123, 0).unwrap();
/// assert_eq!(next_boundary(FIVE_MINUTES, &now), 1_700_000_400);
/// ```
pub fn next_boundary<Tz: TimeZone>(period: Duration, now: &DateTime<Tz>) -> i64 {
    let ts = now.timestamp();
    match alignment_modulus(period) {
        Some(modulus) => ts - ts.rem_euclid(modulus) + modulus,
        None => next_midnight(now),
    }
}

fn next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> i64 {
    let fallback = now.timestamp() + DAY_SECS;
    let Some(midnight) = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    else {
        return fallback;
    };

    let tz = now.timezone();
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + TimeDelta::hours(1))).earliest())
        .map_or(fallback, |boundary| boundary.timestamp())
}
