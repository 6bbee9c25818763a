//! Integration tests for rolling window counters and boundary alignment.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeZone, Timelike};
use tally::align::{self, DAY, FIFTEEN_MINUTES, FIVE_MINUTES, HOUR, MINUTE, THIRTY_MINUTES};
use tally::clock::ManualClock;
use tally::error::Result;
use tally::window::RollingWindowCounter;

// 2023-11-14T22:13:20Z
const START: i64 = 1_700_000_000;

#[test]
fn test_modulus_boundaries_agree_across_start_times() {
    // Two processes started 97 seconds apart agree on every modulus boundary.
    for offset in [0, 97] {
        let now = DateTime::from_timestamp(START + offset, 0).unwrap();
        assert_eq!(align::next_boundary(FIVE_MINUTES, &now), 1_700_000_100);
        assert_eq!(align::next_boundary(FIFTEEN_MINUTES, &now), 1_700_000_100);
        assert_eq!(align::next_boundary(THIRTY_MINUTES, &now), 1_700_001_000);
        assert_eq!(align::next_boundary(HOUR, &now), 1_700_002_800);
    }
}

#[test]
fn test_short_and_irregular_periods() {
    let now = DateTime::from_timestamp(START, 0).unwrap();

    assert_eq!(align::next_boundary(Duration::from_secs(5), &now), START + 1);
    assert_eq!(align::next_boundary(Duration::from_secs(59), &now), START + 1);
    assert_eq!(align::next_boundary(MINUTE, &now), START + 40);
    // Irregular periods fall back to the minute grid.
    assert_eq!(align::next_boundary(Duration::from_secs(7 * 60), &now), START + 40);
}

#[test]
fn test_day_boundary_is_local_midnight() {
    let tz = FixedOffset::east_opt(8 * 3600).unwrap();
    // 2023-11-15T06:13:20+08:00
    let now = DateTime::from_timestamp(START, 0).unwrap().with_timezone(&tz);

    let boundary = align::next_boundary(DAY, &now);
    let at = tz.timestamp_opt(boundary, 0).unwrap();

    assert_eq!((at.hour(), at.minute(), at.second()), (0, 0, 0));
    assert_eq!(at.date_naive(), now.date_naive().succ_opt().unwrap());
    assert_ne!(boundary, START + 86_400);
}

#[test]
fn test_day_window_uses_local_calendar() -> Result<()> {
    let clock = Arc::new(ManualClock::from_unix(START));
    let counter = RollingWindowCounter::with_clock(clock.clone());
    counter.set_period(align::LABEL_1D, DAY)?;

    let expected = align::next_boundary(DAY, &Local.timestamp_opt(START, 0).unwrap());
    assert_eq!(counter.next_boundary(align::LABEL_1D), Some(expected));
    assert!(expected > START);
    assert_ne!(expected, START + 86_400);

    Ok(())
}

#[test]
fn test_exporter_loop_over_standard_windows() -> Result<()> {
    let clock = Arc::new(ManualClock::from_unix(START));
    let counter = RollingWindowCounter::with_clock(clock.clone());
    counter.set_periods(align::standard_windows())?;

    let mut minute_deltas = Vec::new();
    let mut five_minute_deltas = Vec::new();

    // Ten increments per second for twelve minutes, snapshot every second.
    for _ in 0..(12 * 60) {
        counter.inc(10);
        clock.advance(Duration::from_secs(1));

        let snap = counter.snapshot();
        if !snap.writable() {
            continue;
        }
        if let Some(rate) = snap.latest_period_count_rate(align::LABEL_1M) {
            minute_deltas.push(rate);
        }
        if let Some(rate) = snap.latest_period_count_rate(align::LABEL_5M) {
            five_minute_deltas.push(rate.delta);
        }
    }

    assert_eq!(counter.count(), 12 * 60 * 10);
    // Every full minute after the first partial one reports 600.
    assert!(minute_deltas.len() >= 10);
    for rate in &minute_deltas[1..minute_deltas.len() - 1] {
        assert_eq!(rate.delta, 600);
        assert_eq!(rate.rate, 10.0);
    }
    // The first 5m window is partial; the next is whole.
    assert!(five_minute_deltas.len() >= 2);
    assert_eq!(five_minute_deltas[1], 3000);

    Ok(())
}

#[test]
fn test_direct_reads_are_idempotent_within_a_window() -> Result<()> {
    let clock = Arc::new(ManualClock::from_unix(START));
    let counter = RollingWindowCounter::with_clock(clock.clone());
    counter.set_period("5m", FIVE_MINUTES)?;

    counter.inc(300);
    clock.set(DateTime::from_timestamp(1_700_000_100, 0).unwrap());

    let rate = counter.latest_period_count_rate("5m").unwrap();
    assert_eq!(rate.delta, 300);
    assert_eq!(rate.rate, 1.0);

    for _ in 0..5 {
        clock.advance(Duration::from_secs(30));
        assert_eq!(counter.latest_period_count_rate("5m"), None);
    }

    Ok(())
}

#[test]
fn test_concurrent_increments() -> Result<()> {
    let counter = Arc::new(RollingWindowCounter::new());
    counter.set_period("1m", MINUTE)?;

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..1000 {
                    counter.inc(1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(counter.count(), 8000);
    Ok(())
}
