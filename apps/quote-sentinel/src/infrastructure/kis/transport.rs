//! Resilient REST Transport
//!
//! All KIS REST traffic funnels through [`RestTransport`], which layers the
//! recovery behavior the upstream demands:
//!
//! - token-bucket rate limiting ahead of every request
//! - exponential backoff with jitter between retries
//! - expired-token detection, including the gateway quirk of reporting an
//!   expired token as HTTP 500 with `msg_cd` `EGW00123`, followed by a
//!   single forced refresh and retry
//! - a cooldown pause after a run of consecutive failures, shared across
//!   requests, so a dead upstream is probed gently
//! - periodic HTTP client rebuilds within a retry loop, which clears
//!   half-dead pooled connections
//!
//! Classification is strict: 429 and 5xx retry, auth statuses refresh, any
//! other 4xx fails fast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedError, MarketFeed};
use crate::domain::market::{QuoteSample, Symbol};
use crate::infrastructure::config::{Credentials, TransportSettings};
use crate::infrastructure::kis::auth::{AuthError, TokenManager};
use crate::infrastructure::kis::messages::{
    ApiEnvelope, ApiErrorBody, CUSTTYPE, MULTI_PRICE_MAX_SYMBOLS, MULTI_PRICE_PATH,
    MultiPriceItem, TR_MULTI_PRICE, multi_price_params,
};
use crate::infrastructure::metrics::{record_transport_cooldown, record_transport_retry};

/// Connect timeout for the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request timeout for the HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

// =============================================================================
// Error Types
// =============================================================================

/// REST transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The upstream rejected the request with a non-retryable 4xx.
    #[error("request rejected with status {status}")]
    Fatal {
        /// HTTP status returned by the upstream.
        status: u16,
    },

    /// The gateway answered 2xx but reported a business-level failure.
    #[error("gateway error {msg_cd}: {msg1}")]
    Gateway {
        /// Gateway message code.
        msg_cd: String,
        /// Gateway message text.
        msg1: String,
    },

    /// Token issuance itself failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// All retries were exhausted.
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Description of the last failure.
        last: String,
    },

    /// Shutdown was requested while the request was in flight.
    #[error("request cancelled")]
    Cancelled,
}

/// How one attempt's outcome steers the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptFailure {
    /// Retry after backoff.
    Retryable {
        /// Failure class for metrics and logs.
        class: &'static str,
        /// Human-readable detail.
        detail: String,
    },
    /// Force a token refresh, then retry without backoff.
    AuthExpired {
        /// HTTP status that triggered the refresh.
        status: u16,
    },
}

/// How an HTTP status steers the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StatusClass {
    /// 2xx.
    Success,
    /// Retry after backoff.
    Retryable(&'static str),
    /// Refresh the token and retry.
    AuthExpired,
    /// Fail fast, no retry.
    Fatal,
}

/// Classify an HTTP status, with the gateway's error code when one was
/// parseable from the body.
fn classify_status(status: u16, msg_cd: Option<&str>) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::AuthExpired,
        429 => StatusClass::Retryable("rate_limited"),
        // The gateway sometimes wraps an expired token in a 500.
        500 if msg_cd == Some(crate::infrastructure::kis::messages::MSG_CD_EXPIRED_TOKEN) => {
            StatusClass::AuthExpired
        }
        500..=599 => StatusClass::Retryable("server_error"),
        _ => StatusClass::Fatal,
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay before retry `attempt` (1-based):
/// `min(base * 2^(attempt-1), cap)` plus uniform jitter in `[0, jitter)`.
#[must_use]
pub fn compute_backoff(
    attempt: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(2_u32.saturating_pow(exp)).min(cap);
    let jitter_ms = jitter.as_millis();
    if jitter_ms == 0 {
        return scaled;
    }
    let extra = rand::rng().random_range(0..jitter_ms);
    scaled + Duration::from_millis(u64::try_from(extra).unwrap_or(u64::MAX))
}

// =============================================================================
// Consecutive-Failure Budget
// =============================================================================

/// Tracks consecutive failures across all requests and mandates a cooldown
/// pause once the run gets long enough.
#[derive(Debug)]
pub struct RequestBudget {
    consecutive: AtomicU32,
    cooldown_after: u32,
    cooldown: Duration,
}

impl RequestBudget {
    /// Create a budget from transport settings.
    #[must_use]
    pub const fn new(cooldown_after: u32, cooldown: Duration) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            cooldown_after,
            cooldown,
        }
    }

    /// Record a failure. Returns the cooldown to observe when the
    /// consecutive-failure threshold was just reached; the counter resets
    /// so the next run starts from zero.
    pub fn note_failure(&self) -> Option<Duration> {
        if self.cooldown_after == 0 {
            return None;
        }
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.cooldown_after {
            self.consecutive.store(0, Ordering::SeqCst);
            Some(self.cooldown)
        } else {
            None
        }
    }

    /// Record a success, ending any failure run.
    pub fn note_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Token-bucket rate limiter. Capacity equals the per-second rate, so a
/// quiet period earns at most one second of burst.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Create a limiter refilling at `per_sec` tokens per second.
    #[must_use]
    pub fn new(per_sec: u32) -> Self {
        let capacity = f64::from(per_sec.max(1));
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill if the bucket is empty.
    ///
    /// Returns `false` if cancellation fired while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let elapsed = state.refilled_at.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.refilled_at = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Retrying, rate-limited REST client for the KIS API.
pub struct RestTransport {
    settings: TransportSettings,
    base_url: String,
    credentials: Credentials,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
    budget: RequestBudget,
    client: RwLock<reqwest::Client>,
    cancel: CancellationToken,
}

impl RestTransport {
    /// Create a transport against `base_url`.
    #[must_use]
    pub fn new(
        settings: TransportSettings,
        base_url: String,
        credentials: Credentials,
        tokens: Arc<TokenManager>,
        cancel: CancellationToken,
    ) -> Self {
        let limiter = RateLimiter::new(settings.rate_limit_per_sec);
        let budget = RequestBudget::new(settings.cooldown_after, settings.cooldown);
        Self {
            settings,
            base_url,
            credentials,
            tokens,
            limiter,
            budget,
            client: RwLock::new(build_client()),
            cancel,
        }
    }

    /// The shared HTTP client, also used for token issuance.
    #[must_use]
    pub fn client(&self) -> reqwest::Client {
        self.client.read().clone()
    }

    /// Execute one GET against a KIS quotation endpoint, retrying per the
    /// transport settings, and decode the response envelope.
    pub async fn get_envelope<T: DeserializeOwned>(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(String, String)],
    ) -> Result<ApiEnvelope<T>, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let mut last_failure = String::from("no attempt made");
        let mut refreshed = false;

        for attempt in 1..=self.settings.max_retries.max(1) {
            if !self.limiter.acquire(&self.cancel).await {
                return Err(TransportError::Cancelled);
            }

            // Rebuild the pooled client periodically within a retry loop.
            if attempt > 1
                && self.settings.session_reset_every > 0
                && (attempt - 1) % self.settings.session_reset_every == 0
            {
                tracing::info!(attempt, "rebuilding http client");
                *self.client.write() = build_client();
            }

            let failure = match self.attempt(&url, tr_id, params).await {
                Ok(envelope) => {
                    self.budget.note_success();
                    return Ok(envelope);
                }
                Err(AttemptOutcome::Terminal(e)) => return Err(e),
                Err(AttemptOutcome::Failed(failure)) => failure,
            };

            match failure {
                AttemptFailure::AuthExpired { status } => {
                    record_transport_retry("auth_expired");
                    if refreshed {
                        // The fresh token was rejected too; retrying cannot
                        // help, the credentials themselves are bad.
                        tracing::error!(status, tr_id, "refreshed token rejected upstream");
                        return Err(TransportError::Auth(AuthError::Rejected { status }));
                    }
                    tracing::info!(status, attempt, tr_id, "token expired upstream, refreshing");
                    self.tokens.refresh(&self.client()).await?;
                    refreshed = true;
                    last_failure = format!("auth expired (http {status})");
                    // The refreshed token gets one immediate retry.
                    continue;
                }
                AttemptFailure::Retryable { class, detail } => {
                    record_transport_retry(class);
                    tracing::warn!(
                        attempt,
                        max = self.settings.max_retries,
                        tr_id,
                        class,
                        %detail,
                        "request attempt failed"
                    );
                    last_failure = detail;
                    self.observe_budget().await?;
                    if attempt < self.settings.max_retries {
                        let delay = compute_backoff(
                            attempt,
                            self.settings.backoff_base,
                            self.settings.backoff_cap,
                            self.settings.backoff_jitter,
                        );
                        tokio::select! {
                            () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(TransportError::Exhausted {
            attempts: self.settings.max_retries.max(1),
            last: last_failure,
        })
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        tr_id: &str,
        params: &[(String, String)],
    ) -> Result<ApiEnvelope<T>, AttemptOutcome> {
        let client = self.client();
        let bearer = self
            .tokens
            .bearer(&client)
            .await
            .map_err(|e| AttemptOutcome::Failed(AttemptFailure::Retryable {
                class: "token_issue",
                detail: e.to_string(),
            }))?;

        let response = client
            .get(url)
            .header("authorization", format!("Bearer {bearer}"))
            .header("appkey", self.credentials.app_key())
            .header("appsecret", self.credentials.app_secret())
            .header("tr_id", tr_id)
            .header("custtype", CUSTTYPE)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                AttemptOutcome::Failed(AttemptFailure::Retryable {
                    class: "network",
                    detail: e.to_string(),
                })
            })?;

        let status = response.status().as_u16();
        if !(200..=299).contains(&status) {
            let msg_cd = response
                .json::<ApiErrorBody>()
                .await
                .ok()
                .map(|body| body.msg_cd);
            return Err(match classify_status(status, msg_cd.as_deref()) {
                StatusClass::Fatal => {
                    AttemptOutcome::Terminal(TransportError::Fatal { status })
                }
                StatusClass::AuthExpired => {
                    AttemptOutcome::Failed(AttemptFailure::AuthExpired { status })
                }
                StatusClass::Retryable(class) => {
                    AttemptOutcome::Failed(AttemptFailure::Retryable {
                        class,
                        detail: format!("http {status}"),
                    })
                }
                // Unreachable: status is non-2xx here.
                StatusClass::Success => AttemptOutcome::Failed(AttemptFailure::Retryable {
                    class: "unexpected",
                    detail: format!("http {status}"),
                }),
            });
        }

        let envelope: ApiEnvelope<T> = response.json().await.map_err(|e| {
            AttemptOutcome::Failed(AttemptFailure::Retryable {
                class: "decode",
                detail: e.to_string(),
            })
        })?;

        if envelope.is_expired_token() {
            return Err(AttemptOutcome::Failed(AttemptFailure::AuthExpired {
                status,
            }));
        }
        if !envelope.is_success() {
            return Err(AttemptOutcome::Terminal(TransportError::Gateway {
                msg_cd: envelope.msg_cd,
                msg1: envelope.msg1,
            }));
        }
        Ok(envelope)
    }

    /// Apply the consecutive-failure budget, sleeping out a cooldown when
    /// one is due.
    async fn observe_budget(&self) -> Result<(), TransportError> {
        if let Some(cooldown) = self.budget.note_failure() {
            record_transport_cooldown();
            tracing::warn!(
                cooldown_secs = cooldown.as_secs(),
                "consecutive failures reached threshold, cooling down"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(cooldown) => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport")
            .field("base_url", &self.base_url)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single attempt inside the retry loop.
enum AttemptOutcome {
    /// Stop retrying and surface this error.
    Terminal(TransportError),
    /// The attempt failed in a way the loop may recover from.
    Failed(AttemptFailure),
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

// =============================================================================
// Market Feed Adapter
// =============================================================================

/// [`MarketFeed`] implementation over the batched multi-price endpoint.
#[derive(Debug)]
pub struct KisMarketFeed {
    transport: Arc<RestTransport>,
}

impl KisMarketFeed {
    /// Create a feed over a transport.
    #[must_use]
    pub const fn new(transport: Arc<RestTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl MarketFeed for KisMarketFeed {
    /// Fetch quotes for `symbols`, splitting at the endpoint's thirty-symbol
    /// cap so every requested symbol is covered regardless of batch size.
    async fn fetch_batch(
        &self,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, QuoteSample>, FeedError> {
        let mut quotes = HashMap::with_capacity(symbols.len());
        for chunk in symbols.chunks(MULTI_PRICE_MAX_SYMBOLS) {
            let params = multi_price_params(chunk);
            let envelope: ApiEnvelope<MultiPriceItem> = self
                .transport
                .get_envelope(MULTI_PRICE_PATH, TR_MULTI_PRICE, &params)
                .await
                .map_err(|e| match e {
                    TransportError::Cancelled => FeedError::Cancelled,
                    TransportError::Auth(e) => FeedError::AuthFailed(e.to_string()),
                    other => FeedError::Unavailable(other.to_string()),
                })?;

            let observed_at = Utc::now();
            quotes.extend(
                envelope
                    .output
                    .into_iter()
                    .filter_map(|item| item.into_sample(observed_at)),
            );
        }
        Ok(quotes)
    }
}
