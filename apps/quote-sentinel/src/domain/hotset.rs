//! Hot-Set Selection and Rebalancing
//!
//! Scores the universe from the latest snapshot, selects a bounded top-N
//! target set for streaming, and computes the subscribe/unsubscribe delta
//! versus the currently active set.
//!
//! # Design
//!
//! Selection is a pure function of (snapshot, weights, cooldowns, capacity):
//! no clocks, no I/O. The rebalance loop resolves cooldowns from the state
//! store and applies the resulting plan through the stream client. Flap
//! prevention excludes recently unsubscribed symbols from the target set
//! unless they are needed to fill remaining capacity, so cooldowns protect
//! stability without starving the hot set.

use std::collections::{BTreeSet, HashSet};

use rust_decimal::prelude::ToPrimitive;

use crate::domain::market::{Snapshot, Symbol};

/// Weights for the hot-set score. All components are non-negative; the
/// score is a weighted sum, so relative magnitudes are what matter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    /// Weight for proximity of disparity to the alert threshold.
    pub proximity: f64,
    /// Weight for intraday volatility (range over previous close).
    pub volatility: f64,
    /// Weight for log-scaled traded value.
    pub traded_value: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            proximity: 0.5,
            volatility: 0.3,
            traded_value: 0.2,
        }
    }
}

/// A scored candidate for the hot set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSymbol {
    /// Symbol identifier.
    pub symbol: Symbol,
    /// Composite score; higher ranks earlier.
    pub score: f64,
    /// Traded value used as the first tie-break.
    pub traded_value: f64,
}

/// Score one snapshot entry.
///
/// `proximity` grows as the disparity approaches `disparity_threshold`
/// (1.0 at the threshold itself, falling off with distance); symbols with
/// no disparity data get zero proximity. Traded value enters log-scaled so
/// mega-caps do not drown out everything else.
#[must_use]
pub fn score_sample(
    sample: &crate::domain::market::QuoteSample,
    disparity_threshold: f64,
    weights: &ScoringWeights,
) -> ScoreParts {
    let proximity = sample.disparity().map_or(0.0, |d| {
        let distance = (d - disparity_threshold).abs();
        1.0 / (1.0 + distance * 10.0)
    });
    let volatility = sample.intraday_range();
    let traded_value = sample.traded_value.to_f64().unwrap_or(0.0).max(0.0);
    let score = weights.proximity * proximity
        + weights.volatility * volatility
        + weights.traded_value * (1.0 + traded_value).ln();
    ScoreParts {
        score,
        traded_value,
    }
}

/// Score plus its tie-break input, before attaching a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreParts {
    /// Composite score.
    pub score: f64,
    /// Traded value (f64, for tie-breaks).
    pub traded_value: f64,
}

/// Rank the snapshot: score descending, ties broken by traded value
/// descending, then symbol ascending. The ordering is total and
/// deterministic for equal inputs.
#[must_use]
pub fn rank_snapshot(
    snapshot: &Snapshot,
    disparity_threshold: f64,
    weights: &ScoringWeights,
) -> Vec<ScoredSymbol> {
    let mut ranked: Vec<ScoredSymbol> = snapshot
        .quotes
        .iter()
        .map(|(symbol, sample)| {
            let parts = score_sample(sample, disparity_threshold, weights);
            ScoredSymbol {
                symbol: symbol.clone(),
                score: parts.score,
                traded_value: parts.traded_value,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.traded_value.total_cmp(&a.traded_value))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    ranked
}

/// Select the target hot set from a ranked snapshot.
///
/// Takes the top `max_subs` candidates, skipping symbols in `in_cooldown`
/// first. If the cooldown-free candidates cannot fill `max_subs`, the
/// highest-ranked cooldown symbols backfill the remaining capacity.
#[must_use]
pub fn select_targets(
    ranked: &[ScoredSymbol],
    max_subs: usize,
    in_cooldown: &HashSet<Symbol>,
) -> BTreeSet<Symbol> {
    let mut targets: BTreeSet<Symbol> = ranked
        .iter()
        .filter(|c| !in_cooldown.contains(&c.symbol))
        .take(max_subs)
        .map(|c| c.symbol.clone())
        .collect();

    if targets.len() < max_subs {
        for candidate in ranked {
            if targets.len() >= max_subs {
                break;
            }
            targets.insert(candidate.symbol.clone());
        }
    }

    targets
}

/// The delta between the active subscription set and a target set.
///
/// A pure set difference: `subscribe = target − current`,
/// `unsubscribe = current − target`. Empty plans are valid no-ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// Symbols to register on the stream.
    pub subscribe: BTreeSet<Symbol>,
    /// Symbols to release from the stream.
    pub unsubscribe: BTreeSet<Symbol>,
}

impl RebalancePlan {
    /// Compute the delta between `current` and `target`.
    #[must_use]
    pub fn diff(current: &BTreeSet<Symbol>, target: &BTreeSet<Symbol>) -> Self {
        Self {
            subscribe: target.difference(current).cloned().collect(),
            unsubscribe: current.difference(target).cloned().collect(),
        }
    }

    /// Whether the plan changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Total number of control messages this plan will emit.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribe.len() + self.unsubscribe.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::market::QuoteSample;

    fn snapshot(entries: &[(&str, i64, i64, i64)]) -> Snapshot {
        // (symbol, price, ma25, traded_value)
        let quotes: HashMap<Symbol, QuoteSample> = entries
            .iter()
            .map(|(sym, price, ma25, value)| {
                (
                    (*sym).to_string(),
                    QuoteSample {
                        price: Decimal::from(*price),
                        prev_close: Decimal::from(*ma25),
                        day_high: Decimal::from(*price + 2),
                        day_low: Decimal::from(*price - 2),
                        traded_value: Decimal::from(*value),
                        ma25: Some(Decimal::from(*ma25)),
                        observed_at: Utc::now(),
                    },
                )
            })
            .collect();
        Snapshot {
            taken_at: Some(Utc::now()),
            quotes,
        }
    }

    #[test]
    fn ranking_is_deterministic_with_tie_breaks() {
        // Identical prices and averages; only traded value and symbol differ.
        let snap = snapshot(&[
            ("B", 100, 100, 500),
            ("A", 100, 100, 500),
            ("C", 100, 100, 900),
        ]);
        let ranked = rank_snapshot(&snap, -0.08, &ScoringWeights::default());
        let order: Vec<&str> = ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn selection_bounded_by_capacity() {
        let snap = snapshot(&[
            ("A", 92, 100, 100),
            ("B", 95, 100, 200),
            ("C", 99, 100, 300),
            ("D", 101, 100, 400),
        ]);
        let ranked = rank_snapshot(&snap, -0.08, &ScoringWeights::default());
        let targets = select_targets(&ranked, 2, &HashSet::new());
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn near_threshold_symbol_outranks_far_one() {
        // A sits exactly on the disparity threshold; D is far above it.
        let snap = snapshot(&[("A", 92, 100, 100), ("D", 120, 100, 100)]);
        let ranked = rank_snapshot(&snap, -0.08, &ScoringWeights::default());
        assert_eq!(ranked[0].symbol, "A");
    }

    #[test]
    fn cooldown_symbols_excluded_when_alternatives_exist() {
        let snap = snapshot(&[
            ("A", 92, 100, 100),
            ("B", 93, 100, 100),
            ("C", 94, 100, 100),
        ]);
        let ranked = rank_snapshot(&snap, -0.08, &ScoringWeights::default());
        let cooldown: HashSet<Symbol> = ["A".to_string()].into_iter().collect();
        let targets = select_targets(&ranked, 2, &cooldown);
        assert!(!targets.contains("A"));
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn cooldown_symbols_backfill_when_capacity_unmet() {
        let snap = snapshot(&[("A", 92, 100, 100), ("B", 93, 100, 100)]);
        let ranked = rank_snapshot(&snap, -0.08, &ScoringWeights::default());
        let cooldown: HashSet<Symbol> =
            ["A".to_string(), "B".to_string()].into_iter().collect();
        // Cooldown never blocks correctness entirely: capacity of 2 with
        // only cooldown candidates still yields a full set.
        let targets = select_targets(&ranked, 2, &cooldown);
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn diff_is_pure_set_difference() {
        let current: BTreeSet<Symbol> =
            ["A", "B", "C"].iter().map(ToString::to_string).collect();
        let target: BTreeSet<Symbol> =
            ["B", "C", "D"].iter().map(ToString::to_string).collect();
        let plan = RebalancePlan::diff(&current, &target);
        assert_eq!(
            plan.subscribe,
            ["D"].iter().map(ToString::to_string).collect()
        );
        assert_eq!(
            plan.unsubscribe,
            ["A"].iter().map(ToString::to_string).collect()
        );
    }

    #[test]
    fn identical_sets_produce_empty_plan() {
        let set: BTreeSet<Symbol> = ["A", "B"].iter().map(ToString::to_string).collect();
        let plan = RebalancePlan::diff(&set, &set.clone());
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }
}
