//! Batch Scanner
//!
//! Walks the full symbol universe in fixed-size batches against the REST
//! feed and assembles a point-in-time snapshot. A universe of `n` symbols
//! with batch size `b` costs exactly `ceil(n / b)` upstream calls per cycle.
//!
//! Failed batches are skipped, not retried within the cycle: their symbols
//! are absent from the snapshot and the failure count is reported so the
//! scan loop can distinguish a degraded cycle from a dead upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedError, MarketFeed};
use crate::domain::market::{Snapshot, Symbol, SymbolInfo};

/// Scanner pacing configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScannerSettings {
    /// Symbols per upstream request.
    pub batch_size: usize,
    /// Pause between consecutive batch requests within one cycle.
    pub batch_gap: Duration,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_gap: Duration::from_millis(200),
        }
    }
}

/// Result of one scan cycle.
#[derive(Debug)]
pub struct ScanOutcome {
    /// The assembled snapshot, possibly partial.
    pub snapshot: Snapshot,
    /// Batches that failed and were skipped.
    pub failed_batches: usize,
    /// Total batches attempted this cycle.
    pub total_batches: usize,
    /// Whether shutdown interrupted the cycle.
    pub cancelled: bool,
    /// Set when the feed reported unrecoverable authentication failure;
    /// the cycle was abandoned at that point.
    pub auth_failure: Option<String>,
}

impl ScanOutcome {
    /// True when every batch in the cycle failed.
    #[must_use]
    pub const fn is_total_failure(&self) -> bool {
        self.total_batches > 0 && self.failed_batches == self.total_batches
    }
}

/// Paced full-universe scanner.
pub struct Scanner<F> {
    feed: Arc<F>,
    settings: ScannerSettings,
}

impl<F: MarketFeed> Scanner<F> {
    /// Create a scanner over a market feed.
    pub fn new(feed: Arc<F>, settings: ScannerSettings) -> Self {
        let settings = ScannerSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        Self { feed, settings }
    }

    /// Run one full scan cycle over `universe`.
    ///
    /// Reference data (name, daily average) from the universe is merged into
    /// each returned quote so downstream consumers see complete samples.
    pub async fn scan_once(
        &self,
        universe: &[SymbolInfo],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let reference: HashMap<&str, &SymbolInfo> =
            universe.iter().map(|info| (info.code.as_str(), info)).collect();
        let codes: Vec<Symbol> = universe.iter().map(|info| info.code.clone()).collect();
        let total_batches = codes.len().div_ceil(self.settings.batch_size);

        let mut quotes = HashMap::with_capacity(codes.len());
        let mut failed_batches = 0;
        let mut cancelled = false;
        let mut auth_failure = None;

        for (index, batch) in codes.chunks(self.settings.batch_size).enumerate() {
            if index > 0 {
                tokio::select! {
                    () = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    () = tokio::time::sleep(self.settings.batch_gap) => {}
                }
            }

            match self.feed.fetch_batch(batch).await {
                Ok(fetched) => {
                    for (symbol, mut sample) in fetched {
                        if let Some(info) = reference.get(symbol.as_str()) {
                            sample.ma25 = info.ma25;
                        }
                        quotes.insert(symbol, sample);
                    }
                }
                Err(FeedError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(FeedError::AuthFailed(detail)) => {
                    // No point finishing the cycle; every remaining batch
                    // would fail the same way.
                    auth_failure = Some(detail);
                    break;
                }
                Err(e) => {
                    failed_batches += 1;
                    tracing::warn!(
                        batch = index,
                        size = batch.len(),
                        error = %e,
                        "batch failed, skipping"
                    );
                }
            }
        }

        ScanOutcome {
            snapshot: Snapshot {
                taken_at: Some(now),
                quotes,
            },
            failed_batches,
            total_batches,
            cancelled,
            auth_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use crate::domain::market::QuoteSample;

    use super::*;

    struct CountingFeed {
        calls: AtomicUsize,
        fail_batch: Option<usize>,
        auth_fail_batch: Option<usize>,
    }

    impl CountingFeed {
        fn new(fail_batch: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_batch,
                auth_fail_batch: None,
            }
        }

        fn rejecting_auth(auth_fail_batch: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_batch: None,
                auth_fail_batch: Some(auth_fail_batch),
            }
        }
    }

    #[async_trait]
    impl MarketFeed for CountingFeed {
        async fn fetch_batch(
            &self,
            symbols: &[Symbol],
        ) -> Result<HashMap<Symbol, QuoteSample>, FeedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batch == Some(call) {
                return Err(FeedError::Unavailable("http 503".into()));
            }
            if self.auth_fail_batch == Some(call) {
                return Err(FeedError::AuthFailed("rejected with status 403".into()));
            }
            Ok(symbols
                .iter()
                .map(|s| (s.clone(), sample(100)))
                .collect())
        }
    }

    fn sample(price: i64) -> QuoteSample {
        QuoteSample {
            price: Decimal::from(price),
            prev_close: Decimal::from(price),
            day_high: Decimal::from(price),
            day_low: Decimal::from(price),
            traded_value: Decimal::from(1_000_000),
            ma25: None,
            observed_at: now(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn universe(n: usize) -> Vec<SymbolInfo> {
        (0..n)
            .map(|i| SymbolInfo {
                code: format!("{i:06}"),
                name: format!("Issuer {i}"),
                ma25: Some(Decimal::from(110)),
            })
            .collect()
    }

    fn scanner(feed: Arc<CountingFeed>, batch_size: usize) -> Scanner<CountingFeed> {
        Scanner::new(
            feed,
            ScannerSettings {
                batch_size,
                batch_gap: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn five_symbols_with_batch_two_makes_three_calls() {
        let feed = Arc::new(CountingFeed::new(None));
        let outcome = scanner(Arc::clone(&feed), 2)
            .scan_once(&universe(5), now(), &CancellationToken::new())
            .await;

        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.total_batches, 3);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.snapshot.quotes.len(), 5);
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_without_aborting_cycle() {
        let feed = Arc::new(CountingFeed::new(Some(1)));
        let outcome = scanner(feed, 2)
            .scan_once(&universe(5), now(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.snapshot.quotes.len(), 3);
        assert!(!outcome.is_total_failure());
    }

    #[tokio::test]
    async fn reference_average_is_merged_into_quotes() {
        let feed = Arc::new(CountingFeed::new(None));
        let outcome = scanner(feed, 2)
            .scan_once(&universe(2), now(), &CancellationToken::new())
            .await;

        let quote = &outcome.snapshot.quotes["000001"];
        assert_eq!(quote.ma25, Some(Decimal::from(110)));
    }

    #[tokio::test]
    async fn auth_failure_abandons_the_cycle() {
        let feed = Arc::new(CountingFeed::rejecting_auth(1));
        let outcome = scanner(Arc::clone(&feed), 2)
            .scan_once(&universe(6), now(), &CancellationToken::new())
            .await;

        // Remaining batches are not attempted; the failure is surfaced.
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.auth_failure.as_deref(),
            Some("rejected with status 403")
        );
        assert_eq!(outcome.snapshot.quotes.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_cycle_between_batches() {
        let feed = Arc::new(CountingFeed::new(None));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = scanner(Arc::clone(&feed), 2)
            .scan_once(&universe(5), now(), &cancel)
            .await;

        assert!(outcome.cancelled);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }
}
