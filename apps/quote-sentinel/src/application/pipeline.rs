//! Ingestion Pipeline
//!
//! The three long-running loops that make up the sentinel, plus the shared
//! degradation state they coordinate through:
//!
//! - **scan loop**: full-universe REST sweep on a fixed interval, publishing
//!   each snapshot over a watch channel and feeding samples to the signal
//!   engine. Cycles where every batch fails widen the interval and
//!   eventually flip safe mode on.
//! - **rebalance loop**: scores the latest snapshot, selects the hot set
//!   under the capacity cap and resubscribe cooldowns, and applies the
//!   subscribe/unsubscribe diff to the live stream.
//! - **tick pump**: drains the stream's broadcast channel into the signal
//!   engine. A lagged receiver means ticks were dropped oldest-first; under
//!   the shrink policy that also sheds subscription capacity.
//!
//! All three loops exit cooperatively on cancellation.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AlertSink, ControlError, MarketFeed, StateStore, StreamControl};
use crate::application::scanner::Scanner;
use crate::domain::hotset::{RebalancePlan, ScoringWeights, rank_snapshot, select_targets};
use crate::domain::market::{AlertRecord, CooldownReason, Snapshot, SymbolInfo, Tick};
use crate::domain::signal::SignalEngine;
use crate::infrastructure::metrics::{
    record_alert_emitted, record_scan_cycle, record_ticks_dropped, set_active_subscriptions,
    set_safe_mode,
};

/// Subscriptions shed per overflow event under the shrink policy.
const SHED_STEP: usize = 2;

/// Healthy rebalance passes required to restore one shed subscription.
const RECOVER_AFTER: usize = 3;

/// Cap on scan-interval widening while the upstream is down (2^3 = 8x).
const MAX_WIDEN_EXP: u32 = 3;

// =============================================================================
// Policy and Configuration
// =============================================================================

/// What to do when tick consumers fall behind the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued ticks and keep the subscription set.
    DropOldest,
    /// Drop oldest ticks and also shed subscription capacity until the
    /// consumer keeps up again.
    ShrinkSubscriptions,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(Self::DropOldest),
            "shrink_subscriptions" | "shrink-subscriptions" => Ok(Self::ShrinkSubscriptions),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Unrecoverable pipeline failure. Transient upstream trouble is absorbed
/// inside the loops; this only surfaces when carrying on cannot help.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The upstream rejected a freshly refreshed token. The configured
    /// credentials are bad and the process should stop.
    #[error("authentication is not recovering: {0}")]
    AuthFailed(String),
}

/// Pipeline-level tunables shared by the three loops.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Interval between full-universe scan cycles.
    pub scan_interval: Duration,
    /// Interval between hot-set rebalance passes.
    pub rebalance_interval: Duration,
    /// Hard cap on live WebSocket subscriptions.
    pub max_ws_subscriptions: usize,
    /// How long an unsubscribed symbol must wait before resubscription.
    pub subscribe_cooldown: Duration,
    /// Suppression window per (symbol, alert kind).
    pub alert_cooldown: Duration,
    /// Disparity threshold, shared by scoring and alerting.
    pub disparity_threshold: f64,
    /// Hot-set scoring weights.
    pub weights: ScoringWeights,
    /// Backpressure policy for the tick path.
    pub overflow_policy: OverflowPolicy,
    /// Consecutive total-failure scan cycles before safe mode engages.
    pub safe_mode_after_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            rebalance_interval: Duration::from_secs(60),
            max_ws_subscriptions: 20,
            subscribe_cooldown: Duration::from_secs(180),
            alert_cooldown: Duration::from_secs(600),
            disparity_threshold: -0.08,
            weights: ScoringWeights::default(),
            overflow_policy: OverflowPolicy::DropOldest,
            safe_mode_after_failures: 3,
        }
    }
}

// =============================================================================
// Degradation State
// =============================================================================

/// Shared load-shedding state between the tick pump (producer of overflow
/// signals) and the scan/rebalance loops (consumers).
#[derive(Debug, Default)]
pub struct DegradeState {
    shed: AtomicUsize,
    healthy_streak: AtomicUsize,
    safe_mode: AtomicBool,
}

impl DegradeState {
    /// Create a fresh, healthy state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick overflow; sheds capacity up to `max_shed`.
    pub fn note_overflow(&self, max_shed: usize) {
        self.healthy_streak.store(0, Ordering::SeqCst);
        let _ = self
            .shed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |shed| {
                Some((shed + SHED_STEP).min(max_shed))
            });
    }

    /// Record a rebalance pass that saw no overflow; restores capacity
    /// one subscription at a time once a streak builds up.
    pub fn note_healthy_rebalance(&self) {
        let streak = self.healthy_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak >= RECOVER_AFTER {
            self.healthy_streak.store(0, Ordering::SeqCst);
            let _ = self
                .shed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |shed| {
                    Some(shed.saturating_sub(1))
                });
        }
    }

    /// Currently shed subscription capacity.
    #[must_use]
    pub fn shed(&self) -> usize {
        self.shed.load(Ordering::SeqCst)
    }

    /// Flip safe mode.
    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::SeqCst);
        set_safe_mode(on);
    }

    /// Whether the pipeline is in safe mode.
    #[must_use]
    pub fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Scan Loop
// =============================================================================

/// Run the full-universe scan loop until cancellation.
///
/// Returns an error only for unrecoverable conditions, specifically
/// credentials the upstream keeps rejecting after a forced token refresh;
/// the caller is expected to shut the process down.
pub async fn run_scan_loop<F, S, K>(
    scanner: Scanner<F>,
    universe: Arc<Vec<SymbolInfo>>,
    engine: Arc<SignalEngine>,
    store: Arc<S>,
    sink: Arc<K>,
    snapshot_tx: watch::Sender<Snapshot>,
    degrade: Arc<DegradeState>,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> Result<(), PipelineError>
where
    F: MarketFeed,
    S: StateStore,
    K: AlertSink + ?Sized,
{
    let names: std::collections::HashMap<&str, &str> = universe
        .iter()
        .map(|info| (info.code.as_str(), info.name.as_str()))
        .collect();
    let mut consecutive_failures: u32 = 0;

    loop {
        let mut outcome = scanner.scan_once(&universe, Utc::now(), &cancel).await;
        if outcome.cancelled {
            break;
        }
        if let Some(detail) = outcome.auth_failure.take() {
            tracing::error!(%detail, "upstream rejects refreshed tokens, stopping scan loop");
            return Err(PipelineError::AuthFailed(detail));
        }

        if outcome.is_total_failure() {
            consecutive_failures += 1;
            record_scan_cycle("failed");
            tracing::warn!(
                consecutive = consecutive_failures,
                batches = outcome.total_batches,
                "scan cycle failed completely"
            );
            if consecutive_failures >= config.safe_mode_after_failures && !degrade.safe_mode() {
                tracing::error!(
                    consecutive = consecutive_failures,
                    "entering safe mode, upstream REST feed unreachable"
                );
                degrade.set_safe_mode(true);
            }
        } else {
            if degrade.safe_mode() {
                tracing::info!("leaving safe mode, REST feed recovered");
                degrade.set_safe_mode(false);
            }
            consecutive_failures = 0;
            record_scan_cycle(if outcome.failed_batches > 0 {
                "partial"
            } else {
                "ok"
            });

            for (symbol, sample) in &outcome.snapshot.quotes {
                if let Some(info) = names.get(symbol.as_str()) {
                    engine.set_reference(symbol, info, sample.ma25.and_then(|d| d.to_f64()));
                }
                let alerts = engine.on_observation(symbol, sample.price, sample.observed_at);
                handle_alerts(alerts, store.as_ref(), sink.as_ref(), config.alert_cooldown).await;
            }

            snapshot_tx.send_replace(outcome.snapshot);
        }

        // Back off the whole cycle while the upstream is down.
        let widen = 2_u32.pow(consecutive_failures.min(MAX_WIDEN_EXP));
        let interval = config.scan_interval.saturating_mul(widen);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!("scan loop stopped");
    Ok(())
}

// =============================================================================
// Rebalance Loop
// =============================================================================

/// Run the hot-set rebalance loop until cancellation.
pub async fn run_rebalance_loop<S, C>(
    stream: Arc<C>,
    store: Arc<S>,
    snapshot_rx: watch::Receiver<Snapshot>,
    degrade: Arc<DegradeState>,
    config: PipelineConfig,
    cancel: CancellationToken,
) where
    S: StateStore,
    C: StreamControl,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.rebalance_interval) => {}
        }

        if degrade.safe_mode() {
            tracing::debug!("safe mode active, skipping rebalance");
            continue;
        }

        let snapshot = snapshot_rx.borrow().clone();
        if snapshot.is_empty() {
            tracing::debug!("no snapshot yet, skipping rebalance");
            continue;
        }

        let now = Utc::now();
        let in_cooldown: HashSet<_> = match store
            .active_cooldowns(&CooldownReason::Resubscribe, now)
            .await
        {
            Ok(entries) => entries.into_iter().map(|(symbol, _)| symbol).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not load resubscribe cooldowns, assuming none");
                HashSet::new()
            }
        };

        let effective_max = config.max_ws_subscriptions.saturating_sub(degrade.shed());
        let ranked = rank_snapshot(&snapshot, config.disparity_threshold, &config.weights);
        let target = select_targets(&ranked, effective_max, &in_cooldown);
        let current = stream.current();
        let plan = RebalancePlan::diff(&current, &target);

        if plan.is_empty() {
            degrade.note_healthy_rebalance();
            continue;
        }

        tracing::info!(
            subscribe = plan.subscribe.len(),
            unsubscribe = plan.unsubscribe.len(),
            capacity = effective_max,
            "applying rebalance plan"
        );

        let unsubscribed = plan.unsubscribe.clone();
        match stream.apply(plan).await {
            Ok(()) => {
                let until = now
                    + chrono::Duration::from_std(config.subscribe_cooldown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                for symbol in &unsubscribed {
                    if let Err(e) = store
                        .set_cooldown(symbol, &CooldownReason::Resubscribe, until)
                        .await
                    {
                        tracing::warn!(symbol, error = %e, "could not persist resubscribe cooldown");
                    }
                }
                if let Err(e) = store.save_subscriptions(&target).await {
                    tracing::warn!(error = %e, "could not persist subscription set");
                }
                #[allow(clippy::cast_precision_loss)]
                set_active_subscriptions(target.len() as f64);
                degrade.note_healthy_rebalance();
            }
            Err(ControlError::Closed) => {
                tracing::warn!("stream control closed, stopping rebalance loop");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "rebalance plan not applied");
            }
        }
    }

    tracing::info!("rebalance loop stopped");
}

// =============================================================================
// Tick Pump
// =============================================================================

/// Drain live ticks into the signal engine until cancellation.
pub async fn run_tick_pump<S, K>(
    mut ticks: broadcast::Receiver<Tick>,
    engine: Arc<SignalEngine>,
    store: Arc<S>,
    sink: Arc<K>,
    degrade: Arc<DegradeState>,
    config: PipelineConfig,
    cancel: CancellationToken,
) where
    S: StateStore,
    K: AlertSink + ?Sized,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = ticks.recv() => match received {
                Ok(tick) => {
                    let alerts = engine.on_observation(&tick.symbol, tick.price, tick.timestamp);
                    if let Err(e) = store
                        .set_last_price(&tick.symbol, tick.price, tick.timestamp)
                        .await
                    {
                        tracing::warn!(symbol = %tick.symbol, error = %e, "could not persist last price");
                    }
                    handle_alerts(alerts, store.as_ref(), sink.as_ref(), config.alert_cooldown)
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    record_ticks_dropped(missed);
                    tracing::warn!(missed, "tick consumer lagged, oldest ticks dropped");
                    if config.overflow_policy == OverflowPolicy::ShrinkSubscriptions {
                        degrade.note_overflow(config.max_ws_subscriptions / 2);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    tracing::info!("tick pump stopped");
}

/// Persist cooldowns and deliver each emitted alert. Failures on either
/// side are logged and never propagate into the ingestion path.
async fn handle_alerts<S, K>(alerts: Vec<AlertRecord>, store: &S, sink: &K, cooldown: Duration)
where
    S: StateStore,
    K: AlertSink + ?Sized,
{
    for alert in alerts {
        record_alert_emitted(alert.kind);
        let until = alert.triggered_at
            + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::seconds(0));
        if let Err(e) = store
            .set_cooldown(&alert.symbol, &CooldownReason::Alert(alert.kind), until)
            .await
        {
            tracing::warn!(symbol = %alert.symbol, error = %e, "could not persist alert cooldown");
        }
        if let Err(e) = sink.deliver(&alert).await {
            tracing::warn!(symbol = %alert.symbol, error = %e, "alert delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use crate::application::ports::{FeedError, InMemoryStateStore, SinkError};
    use crate::application::scanner::ScannerSettings;
    use crate::domain::market::{AlertKind, QuoteSample, Symbol};
    use crate::domain::signal::SignalConfig;

    use super::*;

    #[test]
    fn overflow_policy_parses_case_insensitively() {
        assert_eq!(
            "DROP_OLDEST".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            "shrink-subscriptions".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::ShrinkSubscriptions
        );
        assert!("block".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn degrade_state_sheds_and_recovers() {
        let state = DegradeState::new();
        assert_eq!(state.shed(), 0);

        state.note_overflow(10);
        assert_eq!(state.shed(), SHED_STEP);

        // Shedding is capped.
        for _ in 0..20 {
            state.note_overflow(5);
        }
        assert_eq!(state.shed(), 5);

        // One subscription comes back per healthy streak.
        for _ in 0..RECOVER_AFTER {
            state.note_healthy_rebalance();
        }
        assert_eq!(state.shed(), 4);
    }

    #[test]
    fn overflow_resets_the_healthy_streak() {
        let state = DegradeState::new();
        state.note_overflow(10);
        state.note_healthy_rebalance();
        state.note_healthy_rebalance();
        state.note_overflow(10);
        for _ in 0..(RECOVER_AFTER - 1) {
            state.note_healthy_rebalance();
        }
        assert_eq!(state.shed(), 4);
    }

    #[derive(Default)]
    struct CapturingSink {
        delivered: Mutex<Vec<AlertRecord>>,
    }

    #[async_trait]
    impl AlertSink for CapturingSink {
        async fn deliver(&self, alert: &AlertRecord) -> Result<(), SinkError> {
            self.delivered.lock().push(alert.clone());
            Ok(())
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    struct AuthRejectingFeed;

    #[async_trait]
    impl MarketFeed for AuthRejectingFeed {
        async fn fetch_batch(
            &self,
            _symbols: &[Symbol],
        ) -> Result<HashMap<Symbol, QuoteSample>, FeedError> {
            Err(FeedError::AuthFailed("rejected with status 403".into()))
        }
    }

    #[tokio::test]
    async fn scan_loop_stops_when_auth_is_not_recovering() {
        let scanner = Scanner::new(
            Arc::new(AuthRejectingFeed),
            ScannerSettings {
                batch_size: 10,
                batch_gap: Duration::ZERO,
            },
        );
        let universe = Arc::new(vec![SymbolInfo {
            code: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            ma25: None,
        }]);
        let engine = Arc::new(SignalEngine::new(SignalConfig::default()));
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(CapturingSink::default());
        let (snapshot_tx, _snapshot_rx) = watch::channel(Snapshot::default());

        let result = run_scan_loop(
            scanner,
            universe,
            engine,
            store,
            sink,
            snapshot_tx,
            Arc::new(DegradeState::new()),
            PipelineConfig::default(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn handle_alerts_persists_cooldown_and_delivers() {
        let store = InMemoryStateStore::new();
        let sink = CapturingSink::default();
        let alert = AlertRecord {
            symbol: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            kind: AlertKind::DisparityBelow,
            threshold: -0.08,
            observed: -0.09,
            price: Decimal::from(91),
            triggered_at: t(0),
        };

        handle_alerts(vec![alert], &store, &sink, Duration::from_secs(600)).await;

        assert_eq!(sink.delivered.lock().len(), 1);
        let active = store
            .active_cooldowns(&CooldownReason::Alert(AlertKind::DisparityBelow), t(10))
            .await
            .unwrap();
        assert_eq!(active, vec![("005930".to_string(), t(600))]);
    }
}
