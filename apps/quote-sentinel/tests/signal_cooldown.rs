//! Signal engine cooldown behavior over longer horizons.

use chrono::{DateTime, TimeZone, Utc};
use quote_sentinel::domain::market::AlertKind;
use quote_sentinel::domain::signal::{SignalConfig, SignalEngine};
use rust_decimal_macros::dec;
use std::time::Duration;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn engine() -> SignalEngine {
    let engine = SignalEngine::new(SignalConfig {
        disparity_threshold: -0.08,
        drop_threshold: -0.03,
        drop_window: Duration::from_secs(300),
        alert_cooldown: Duration::from_secs(600),
    });
    engine.set_reference("005930", "Samsung Electronics", Some(100_000.0));
    engine
}

/// A condition that stays true for 20 minutes with a 10 minute cooldown
/// produces exactly two alerts: at the first observation and at cooldown
/// expiry.
#[test]
fn persistent_condition_fires_once_per_cooldown_window() {
    let engine = engine();
    let mut fired: Vec<DateTime<Utc>> = Vec::new();

    let mut at = 0;
    while at < 1200 {
        // Price pinned 9% under the average; disparity stays below -0.08.
        let alerts = engine.on_observation("005930", dec!(91000), t(at));
        for alert in alerts {
            assert_eq!(alert.kind, AlertKind::DisparityBelow);
            fired.push(alert.triggered_at);
        }
        at += 30;
    }

    assert_eq!(fired, vec![t(0), t(600)]);
}

/// Observation cadence does not change how many alerts a persistent
/// condition produces, only when within the window they land.
#[test]
fn alert_count_is_cadence_independent() {
    for cadence in [10_i64, 60, 180] {
        let engine = engine();
        let mut count = 0;

        let mut at = 0;
        while at < 1200 {
            count += engine.on_observation("005930", dec!(91000), t(at)).len();
            at += cadence;
        }

        assert_eq!(count, 2, "cadence {cadence}s");
    }
}

/// Cooldowns are tracked per (symbol, kind): a second symbol in the same
/// condition fires independently.
#[test]
fn cooldowns_are_per_symbol() {
    let engine = engine();
    engine.set_reference("000660", "SK Hynix", Some(200_000.0));

    assert_eq!(engine.on_observation("005930", dec!(91000), t(0)).len(), 1);
    assert_eq!(engine.on_observation("000660", dec!(182000), t(1)).len(), 1);
    // Both suppressed inside their windows.
    assert_eq!(engine.on_observation("005930", dec!(91000), t(300)).len(), 0);
    assert_eq!(engine.on_observation("000660", dec!(182000), t(300)).len(), 0);
}

/// A hydrated cooldown from a previous process run suppresses the
/// condition until its stored expiry.
#[test]
fn hydrated_cooldown_survives_restart() {
    let engine = engine();
    engine.hydrate_cooldowns(vec![(
        "005930".to_string(),
        AlertKind::DisparityBelow,
        t(240),
    )]);

    assert_eq!(engine.on_observation("005930", dec!(91000), t(60)).len(), 0);
    assert_eq!(engine.on_observation("005930", dec!(91000), t(240)).len(), 1);
}

/// Condition clearing and re-crossing inside the cooldown window still
/// does not re-fire; dedup is time-based, not edge-based.
#[test]
fn recrossing_within_cooldown_stays_quiet() {
    let engine = engine();

    assert_eq!(engine.on_observation("005930", dec!(91000), t(0)).len(), 1);
    // Recovers above the threshold...
    assert_eq!(engine.on_observation("005930", dec!(99000), t(120)).len(), 0);
    // ...then crosses again 3 minutes later, still inside the window.
    assert_eq!(engine.on_observation("005930", dec!(91000), t(180)).len(), 0);
    // After expiry the next crossing fires.
    assert_eq!(engine.on_observation("005930", dec!(91000), t(601)).len(), 1);
}
