//! Integration tests for keyed gauges.

use std::sync::Arc;
use std::thread;

use tally::error::Result;
use tally::gauge_map::{GaugeFn, KeyedGauge};
use tally::registry::Registry;
use tally::variables::guarded_ratio;

#[allow(clippy::cast_precision_loss)]
fn register_pool(registry: &Registry) -> Result<Arc<KeyedGauge>> {
    let pool = KeyedGauge::get_or_register(registry, "pool")?;
    pool.set_func_key(
        "total",
        GaugeFn::int(|g| g.value_i64("active").unwrap_or(0) + g.value_i64("idle").unwrap_or(0)),
    );
    pool.set_func_key(
        "utilization",
        GaugeFn::float(|g| {
            let active = g.value_i64("active").unwrap_or(0) as f64;
            let idle = g.value_i64("idle").unwrap_or(0) as f64;
            guarded_ratio(active, active + idle)
        }),
    );
    pool.set_func_key(
        "active-change",
        GaugeFn::int(|g| g.value_i64("active").unwrap_or(0) - g.previous_i64("active").unwrap_or(0)),
    );
    Ok(pool)
}

#[test]
fn test_lookback_across_snapshots() -> Result<()> {
    let registry = Registry::new();
    let pool = register_pool(&registry)?;

    let steps = [(4, 12, 16, 0.25, 4), (8, 8, 16, 0.5, 4), (2, 2, 4, 0.5, -6)];
    for (active, idle, total, utilization, change) in steps {
        pool.update_int64("active", active);
        pool.update_int64("idle", idle);

        let snap = pool.snapshot();
        assert_eq!(snap.value_i64("total"), Some(total));
        assert_eq!(snap.value_f64("utilization"), Some(utilization));
        assert_eq!(snap.value_i64("active-change"), Some(change));
    }
    Ok(())
}

#[test]
fn test_empty_pool_is_guarded() -> Result<()> {
    let registry = Registry::new();
    let pool = register_pool(&registry)?;

    let snap = pool.snapshot();
    assert_eq!(snap.value_i64("total"), Some(0));
    assert_eq!(snap.value_f64("utilization"), Some(0.0));
    assert_eq!(snap.value_i64("active"), None);
    Ok(())
}

#[test]
fn test_snapshot_serializes_split_maps() -> Result<()> {
    let registry = Registry::new();
    let pool = register_pool(&registry)?;
    pool.update_int64("active", 1);
    pool.update_int64("idle", 3);

    let json = serde_json::to_value(pool.snapshot()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "ints": { "active": 1, "active-change": 1, "idle": 3, "total": 4 },
            "floats": { "utilization": 0.25 }
        })
    );
    Ok(())
}

#[test]
fn test_registry_shares_one_pool() -> Result<()> {
    let registry = Arc::new(Registry::new());
    register_pool(&registry)?;

    let workers: Vec<_> = (0..4_i64)
        .map(|w| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || -> Result<()> {
                let pool = KeyedGauge::get_or_register(&registry, "pool")?;
                for i in 0..100 {
                    pool.update_int64(&format!("worker-{w}"), i);
                    pool.snapshot();
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap()?;
    }

    let pool = KeyedGauge::get_or_register(&registry, "pool")?;
    let snap = pool.snapshot();
    for w in 0..4 {
        assert_eq!(snap.value_i64(&format!("worker-{w}")), Some(99));
    }
    assert_eq!(registry.len(), 1);
    Ok(())
}
