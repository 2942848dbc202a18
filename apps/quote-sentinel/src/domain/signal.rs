//! Signal Engine
//!
//! Evaluates alert conditions against incoming price observations and
//! suppresses duplicate alerts with per-(symbol, condition) cooldowns.
//!
//! # Conditions
//!
//! - `DisparityBelow`: the price sits more than a configured fraction below
//!   its 25-day moving average.
//! - `SharpDrop`: the return over a short trailing window falls below a
//!   configured drop threshold.
//!
//! # Cooldowns
//!
//! Suppression is level-based, not edge-based: each observation is compared
//! against the persisted cooldown expiry for its (symbol, kind) pair, so a
//! condition that stays true for the whole window fires at most once per
//! window. Cooldowns are hydrated from the state store at startup and the
//! caller persists new expiries after each emitted alert, which keeps the
//! engine itself synchronous and clock-free.
//!
//! Observations arrive from both the low-frequency scanner path and the
//! high-frequency stream path; no fixed cadence is assumed. Calls for
//! different symbols only contend on short map lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::domain::market::{AlertKind, AlertRecord, Symbol};

/// Configuration for condition thresholds and alert suppression.
#[derive(Debug, Clone, Copy)]
pub struct SignalConfig {
    /// Disparity threshold; the condition fires when disparity < this value.
    pub disparity_threshold: f64,
    /// Short-window return threshold; fires when the return <= this value.
    pub drop_threshold: f64,
    /// Length of the trailing window for the drop condition.
    pub drop_window: Duration,
    /// Suppression window after an alert for the same (symbol, kind).
    pub alert_cooldown: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            disparity_threshold: -0.08,
            drop_threshold: -0.03,
            drop_window: Duration::from_secs(300),
            alert_cooldown: Duration::from_secs(600),
        }
    }
}

/// Per-symbol rolling state owned by the engine.
#[derive(Debug, Default)]
struct SymbolState {
    /// Human-readable name for alert records.
    name: String,
    /// Daily reference average, refreshed from each snapshot.
    ma25: Option<f64>,
    /// Trailing (timestamp, price) window for the drop condition.
    window: VecDeque<(DateTime<Utc>, f64)>,
}

/// Condition evaluation failure, isolated to one symbol's observation.
#[derive(Debug, thiserror::Error)]
enum EvalError {
    #[error("non-positive reference average: {0}")]
    BadReference(f64),
    #[error("price not representable as f64")]
    BadPrice,
}

/// Stateful alert-condition evaluator.
pub struct SignalEngine {
    config: SignalConfig,
    symbols: RwLock<HashMap<Symbol, Arc<Mutex<SymbolState>>>>,
    cooldown_until: Mutex<HashMap<(Symbol, AlertKind), DateTime<Utc>>>,
}

impl SignalEngine {
    /// Create a new engine.
    #[must_use]
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            symbols: RwLock::new(HashMap::new()),
            cooldown_until: Mutex::new(HashMap::new()),
        }
    }

    /// Install or refresh the daily reference data for a symbol.
    pub fn set_reference(&self, symbol: &str, name: &str, ma25: Option<f64>) {
        let state = self.symbol_state(symbol);
        let mut state = state.lock();
        state.name = name.to_string();
        state.ma25 = ma25;
    }

    /// Restore persisted cooldown expiries after a restart so unexpired
    /// windows do not re-fire.
    pub fn hydrate_cooldowns<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Symbol, AlertKind, DateTime<Utc>)>,
    {
        let mut cooldowns = self.cooldown_until.lock();
        for (symbol, kind, until) in entries {
            cooldowns.insert((symbol, kind), until);
        }
    }

    /// Evaluate all conditions against one observation.
    ///
    /// Returns the alerts that fired (already cooldown-filtered). The caller
    /// is responsible for persisting the new cooldown expiry
    /// (`triggered_at + alert_cooldown`) for each returned alert.
    pub fn on_observation(
        &self,
        symbol: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Vec<AlertRecord> {
        let state = self.symbol_state(symbol);
        let mut state = state.lock();

        let Some(price_f) = price.to_f64().filter(|p| *p > 0.0) else {
            tracing::warn!(symbol, %price, "skipping unusable price observation");
            return Vec::new();
        };

        Self::push_window(&mut state.window, at, price_f, self.config.drop_window);

        let mut fired = Vec::new();
        for kind in AlertKind::all() {
            match self.evaluate(*kind, &state, price_f, at) {
                Ok(Some((threshold, observed))) => {
                    if self.try_acquire_cooldown(symbol, *kind, at) {
                        fired.push(AlertRecord {
                            symbol: symbol.to_string(),
                            name: state.name.clone(),
                            kind: *kind,
                            threshold,
                            observed,
                            price,
                            triggered_at: at,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Isolated to this symbol; never aborts other evaluations.
                    tracing::warn!(symbol, kind = kind.as_str(), error = %e, "condition evaluation failed");
                }
            }
        }
        fired
    }

    /// Cooldown expiry for one (symbol, kind), if a window is active.
    #[must_use]
    pub fn cooldown_expiry(&self, symbol: &str, kind: AlertKind) -> Option<DateTime<Utc>> {
        self.cooldown_until
            .lock()
            .get(&(symbol.to_string(), kind))
            .copied()
    }

    fn evaluate(
        &self,
        kind: AlertKind,
        state: &SymbolState,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<(f64, f64)>, EvalError> {
        match kind {
            AlertKind::DisparityBelow => {
                let Some(ma25) = state.ma25 else {
                    return Ok(None);
                };
                if ma25 <= 0.0 {
                    return Err(EvalError::BadReference(ma25));
                }
                let disparity = price / ma25 - 1.0;
                if disparity < self.config.disparity_threshold {
                    Ok(Some((self.config.disparity_threshold, disparity)))
                } else {
                    Ok(None)
                }
            }
            AlertKind::SharpDrop => {
                let Some(&(base_at, base_price)) = state.window.front() else {
                    return Ok(None);
                };
                if base_at >= at || base_price <= 0.0 {
                    return Ok(None);
                }
                if !price.is_finite() {
                    return Err(EvalError::BadPrice);
                }
                let ret = price / base_price - 1.0;
                if ret <= self.config.drop_threshold {
                    Ok(Some((self.config.drop_threshold, ret)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Check the cooldown for (symbol, kind) at `at`, acquiring a new
    /// window iff the previous one has expired.
    fn try_acquire_cooldown(&self, symbol: &str, kind: AlertKind, at: DateTime<Utc>) -> bool {
        let Ok(cooldown) = chrono::Duration::from_std(self.config.alert_cooldown) else {
            return false;
        };
        let key = (symbol.to_string(), kind);
        let mut cooldowns = self.cooldown_until.lock();
        if let Some(until) = cooldowns.get(&key)
            && at < *until
        {
            return false;
        }
        cooldowns.insert(key, at + cooldown);
        true
    }

    fn symbol_state(&self, symbol: &str) -> Arc<Mutex<SymbolState>> {
        if let Some(state) = self.symbols.read().get(symbol) {
            return Arc::clone(state);
        }
        let mut map = self.symbols.write();
        Arc::clone(map.entry(symbol.to_string()).or_default())
    }

    fn push_window(
        window: &mut VecDeque<(DateTime<Utc>, f64)>,
        at: DateTime<Utc>,
        price: f64,
        span: Duration,
    ) {
        // Within one symbol ticks arrive in order; a stale timestamp from
        // the slower scanner path is simply not appended.
        let in_order = window.back().is_none_or(|&(last, _)| at >= last);
        if in_order {
            window.push_back((at, price));
        }
        if let Ok(span) = chrono::Duration::from_std(span) {
            let horizon = at - span;
            while window
                .front()
                .is_some_and(|&(t, _)| t < horizon && window.len() > 1)
            {
                window.pop_front();
            }
        }
    }
}
