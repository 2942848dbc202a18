//! Core Market Data Types
//!
//! Domain types shared by the scanner, stream client and signal engine:
//! universe entries, per-cycle snapshots, real-time ticks and alert records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

/// An exchange-qualified symbol identifier (e.g. "005930").
///
/// Opaque to the pipeline; universe membership is externally supplied.
pub type Symbol = String;

/// A universe entry: symbol plus the daily reference data needed for
/// scoring and the disparity condition. Reference values are produced by
/// the (out-of-process) daily history loader and read from the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    /// Symbol identifier.
    pub code: Symbol,
    /// Human-readable name, carried into alert records.
    pub name: String,
    /// 25-day moving average of the close, if enough history exists.
    pub ma25: Option<Decimal>,
}

/// One symbol's entry in a scan-cycle snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSample {
    /// Last traded price.
    pub price: Decimal,
    /// Previous session close.
    pub prev_close: Decimal,
    /// Intraday high.
    pub day_high: Decimal,
    /// Intraday low.
    pub day_low: Decimal,
    /// Accumulated traded value for the session.
    pub traded_value: Decimal,
    /// 25-day moving average carried over from the universe reference data.
    pub ma25: Option<Decimal>,
    /// When this sample was observed.
    pub observed_at: DateTime<Utc>,
}

impl QuoteSample {
    /// Disparity: distance of the last price from its 25-day moving
    /// average, as a signed fraction (`price / ma25 - 1`).
    ///
    /// Returns `None` when no moving average is available or it is zero.
    #[must_use]
    pub fn disparity(&self) -> Option<f64> {
        let ma25 = self.ma25?;
        if ma25.is_zero() {
            return None;
        }
        let price = self.price.to_f64()?;
        let ma25 = ma25.to_f64()?;
        Some(price / ma25 - 1.0)
    }

    /// Intraday range relative to the previous close, as a fraction.
    ///
    /// Zero when the previous close is missing or zero.
    #[must_use]
    pub fn intraday_range(&self) -> f64 {
        if self.prev_close.is_zero() {
            return 0.0;
        }
        let range = (self.day_high - self.day_low).to_f64().unwrap_or(0.0);
        let prev = self.prev_close.to_f64().unwrap_or(0.0);
        if prev <= 0.0 { 0.0 } else { (range / prev).max(0.0) }
    }
}

/// A full-universe price sample taken in one scan cycle.
///
/// Published atomically and superseded entirely by the next cycle; there is
/// no partial merge between cycles. A cycle with failed batches still
/// publishes whatever coverage it obtained.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// When the cycle completed.
    pub taken_at: Option<DateTime<Utc>>,
    /// Per-symbol samples obtained this cycle.
    pub quotes: HashMap<Symbol, QuoteSample>,
}

impl Snapshot {
    /// Number of symbols covered by this snapshot.
    #[must_use]
    pub fn coverage(&self) -> usize {
        self.quotes.len()
    }

    /// Whether the snapshot carries any data at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Age of the snapshot relative to `now`, if it has been taken.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.taken_at.map(|t| now - t)
    }
}

/// A single real-time price observation from the streaming feed.
///
/// Within one symbol's stream, ticks are processed in arrival order; no
/// ordering is guaranteed across symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Symbol identifier.
    pub symbol: Symbol,
    /// Traded price.
    pub price: Decimal,
    /// Exchange timestamp of the trade.
    pub timestamp: DateTime<Utc>,
}

/// Alert condition kinds evaluated by the signal engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Disparity (price vs. 25-day moving average) crossed below threshold.
    DisparityBelow,
    /// Short-window return fell below the drop threshold.
    SharpDrop,
}

impl AlertKind {
    /// Stable identifier used for cooldown keys and log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DisparityBelow => "disparity_below",
            Self::SharpDrop => "sharp_drop",
        }
    }

    /// All condition kinds, for cooldown hydration at startup.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::DisparityBelow, Self::SharpDrop]
    }
}

/// Namespaces for cooldown entries persisted in the state store.
///
/// Resubscribe cooldowns gate a just-unsubscribed symbol from re-entering
/// the hot set; alert cooldowns gate re-alerting per (symbol, condition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    /// Flap prevention for streaming subscriptions.
    Resubscribe,
    /// Duplicate-alert suppression for one condition kind.
    Alert(AlertKind),
}

impl CooldownReason {
    /// Stable key used in the persisted cooldown table.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Resubscribe => "resubscribe".to_string(),
            Self::Alert(kind) => format!("alert/{}", kind.as_str()),
        }
    }
}

/// The terminal artifact of the signal engine, handed to the alert sink.
///
/// Idempotent for a given (symbol, kind, cooldown window) by construction.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    /// Symbol identifier.
    pub symbol: Symbol,
    /// Human-readable name.
    pub name: String,
    /// Condition kind that fired.
    pub kind: AlertKind,
    /// Configured threshold for the condition.
    pub threshold: f64,
    /// Observed metric value that triggered the alert.
    pub observed: f64,
    /// Price at trigger time.
    pub price: Decimal,
    /// Observation timestamp.
    pub triggered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn sample(price: i64, ma25: Option<i64>) -> QuoteSample {
        QuoteSample {
            price: Decimal::from(price),
            prev_close: Decimal::from(100),
            day_high: Decimal::from(110),
            day_low: Decimal::from(95),
            traded_value: Decimal::from(1_000_000),
            ma25: ma25.map(Decimal::from),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn disparity_relative_to_ma25() {
        let s = sample(92, Some(100));
        let d = s.disparity().unwrap();
        assert!((d - (-0.08)).abs() < 1e-9);
    }

    #[test]
    fn disparity_missing_without_ma25() {
        assert!(sample(92, None).disparity().is_none());
        assert!(sample(92, Some(0)).disparity().is_none());
    }

    #[test]
    fn intraday_range_fraction() {
        let s = sample(100, Some(100));
        assert!((s.intraday_range() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn cooldown_keys_are_namespaced() {
        assert_eq!(CooldownReason::Resubscribe.key(), "resubscribe");
        assert_eq!(
            CooldownReason::Alert(AlertKind::DisparityBelow).key(),
            "alert/disparity_below"
        );
        assert_eq!(
            CooldownReason::Alert(AlertKind::SharpDrop).key(),
            "alert/sharp_drop"
        );
    }

    #[test]
    fn snapshot_coverage_and_age() {
        let mut snap = Snapshot::default();
        assert!(snap.is_empty());
        snap.quotes.insert("005930".to_string(), sample(100, None));
        let now = Utc::now();
        snap.taken_at = Some(now - chrono::Duration::seconds(30));
        assert_eq!(snap.coverage(), 1);
        assert!(snap.age(now).unwrap() >= chrono::Duration::seconds(30));
    }
}
