//! Sentinel Configuration Settings
//!
//! Configuration types for the pipeline, loaded from environment variables.

use std::time::Duration;

use crate::application::pipeline::OverflowPolicy;
use crate::domain::hotset::ScoringWeights;

/// Floor on the rebalance interval; lower values are clamped.
const MIN_REBALANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Trading environment (paper vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live environment (real account).
    Live,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }
}

/// KIS API credentials.
#[derive(Clone)]
pub struct Credentials {
    app_key: String,
    app_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(app_key: String, app_secret: String) -> Self {
        Self {
            app_key,
            app_secret,
        }
    }

    /// Get the application key.
    #[must_use]
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Get the application secret.
    #[must_use]
    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"[REDACTED]")
            .field("app_secret", &"[REDACTED]")
            .finish()
    }
}

/// REST transport resilience settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Maximum attempts per request before giving up.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Cap on the backoff delay.
    pub backoff_cap: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub backoff_jitter: Duration,
    /// Consecutive failures before the transport takes a cooldown pause.
    pub cooldown_after: u32,
    /// Length of the transport cooldown pause.
    pub cooldown: Duration,
    /// Rebuild the HTTP client every N attempts within a request.
    pub session_reset_every: u32,
    /// Token-bucket refill rate, requests per second.
    pub rate_limit_per_sec: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: 8,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: Duration::from_millis(500),
            cooldown_after: 10,
            cooldown: Duration::from_secs(180),
            session_reset_every: 3,
            rate_limit_per_sec: 15,
        }
    }
}

/// Scan loop settings.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Interval between full-universe scan cycles.
    pub interval: Duration,
    /// Symbols per batched quote request.
    pub batch_size: usize,
    /// Pause between consecutive batches within one cycle.
    pub batch_gap: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 50,
            batch_gap: Duration::from_millis(200),
        }
    }
}

/// Hot-set selection and rebalance settings.
#[derive(Debug, Clone)]
pub struct HotSetSettings {
    /// Hard cap on live WebSocket subscriptions.
    pub max_ws_subscriptions: usize,
    /// Interval between rebalance passes (clamped to a 5s floor).
    pub rebalance_interval: Duration,
    /// Cooldown before a just-unsubscribed symbol may re-enter the hot set.
    pub subscribe_cooldown: Duration,
    /// Scoring weights for hot-set ranking.
    pub weights: ScoringWeights,
}

impl Default for HotSetSettings {
    fn default() -> Self {
        Self {
            max_ws_subscriptions: 20,
            rebalance_interval: Duration::from_secs(60),
            subscribe_cooldown: Duration::from_secs(180),
            weights: ScoringWeights::default(),
        }
    }
}

/// Alert condition settings.
#[derive(Debug, Clone)]
pub struct SignalSettings {
    /// Disparity alert threshold (signed fraction below the 25-day average).
    pub disparity_threshold: f64,
    /// Short-window return threshold for the drop alert.
    pub drop_threshold: f64,
    /// Length of the trailing window for the drop alert.
    pub drop_window: Duration,
    /// Suppression window per (symbol, condition).
    pub alert_cooldown: Duration,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            disparity_threshold: -0.08,
            drop_threshold: -0.03,
            drop_window: Duration::from_secs(300),
            alert_cooldown: Duration::from_secs(600),
        }
    }
}

/// WebSocket stream settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Capacity of the tick broadcast channel.
    pub tick_queue_capacity: usize,
    /// Idle read timeout before the connection is considered dead.
    pub read_timeout: Duration,
    /// Pause between consecutive control frames (subscribe/unsubscribe).
    pub control_pacing: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Backpressure policy for the tick path.
    pub overflow_policy: OverflowPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            tick_queue_capacity: 4096,
            read_timeout: Duration::from_secs(60),
            control_pacing: Duration::from_millis(200),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Durable state settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Path to the local database file.
    pub db_path: String,
    /// Path to the cached access-token file.
    pub token_cache_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "sentinel.db".to_string(),
            token_cache_path: "kis_token.json".to_string(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port (also serves /metrics).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone, Default)]
pub struct AlertSettings {
    /// Webhook endpoint for alert delivery; logs only when unset.
    pub webhook_url: Option<String>,
}

/// Complete sentinel configuration.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Trading environment.
    pub environment: Environment,
    /// API credentials.
    pub credentials: Credentials,
    /// REST transport resilience settings.
    pub transport: TransportSettings,
    /// Scan loop settings.
    pub scan: ScanSettings,
    /// Hot-set settings.
    pub hotset: HotSetSettings,
    /// Alert condition settings.
    pub signal: SignalSettings,
    /// Stream settings.
    pub stream: StreamSettings,
    /// Durable state settings.
    pub store: StoreSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Alert delivery settings.
    pub alerts: AlertSettings,
}

impl SentinelConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_key = std::env::var("KIS_APP_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("KIS_APP_KEY".to_string()))?;

        let app_secret = std::env::var("KIS_APP_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("KIS_APP_SECRET".to_string()))?;

        if app_key.is_empty() {
            return Err(ConfigError::EmptyValue("KIS_APP_KEY".to_string()));
        }

        if app_secret.is_empty() {
            return Err(ConfigError::EmptyValue("KIS_APP_SECRET".to_string()));
        }

        let environment = std::env::var("SENTINEL_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let transport = TransportSettings {
            max_retries: parse_env_u32(
                "SENTINEL_MAX_RETRIES",
                TransportSettings::default().max_retries,
            ),
            backoff_base: parse_env_duration_millis(
                "SENTINEL_BACKOFF_BASE_MS",
                TransportSettings::default().backoff_base,
            ),
            backoff_cap: parse_env_duration_secs(
                "SENTINEL_BACKOFF_CAP_SECS",
                TransportSettings::default().backoff_cap,
            ),
            backoff_jitter: parse_env_duration_millis(
                "SENTINEL_BACKOFF_JITTER_MS",
                TransportSettings::default().backoff_jitter,
            ),
            cooldown_after: parse_env_u32(
                "SENTINEL_COOLDOWN_AFTER",
                TransportSettings::default().cooldown_after,
            ),
            cooldown: parse_env_duration_secs(
                "SENTINEL_COOLDOWN_SECS",
                TransportSettings::default().cooldown,
            ),
            session_reset_every: parse_env_u32(
                "SENTINEL_SESSION_RESET_EVERY",
                TransportSettings::default().session_reset_every,
            ),
            rate_limit_per_sec: parse_env_u32(
                "SENTINEL_RATE_LIMIT_PER_SEC",
                TransportSettings::default().rate_limit_per_sec,
            ),
        };

        let scan = ScanSettings {
            interval: parse_env_duration_secs(
                "SENTINEL_SCAN_INTERVAL_SECS",
                ScanSettings::default().interval,
            ),
            batch_size: parse_env_usize(
                "SENTINEL_SCAN_BATCH_SIZE",
                ScanSettings::default().batch_size,
            ),
            batch_gap: parse_env_duration_millis(
                "SENTINEL_SCAN_BATCH_GAP_MS",
                ScanSettings::default().batch_gap,
            ),
        };

        let hotset = HotSetSettings {
            max_ws_subscriptions: parse_env_usize(
                "SENTINEL_MAX_WS_SUBSCRIPTIONS",
                HotSetSettings::default().max_ws_subscriptions,
            ),
            rebalance_interval: parse_env_duration_secs(
                "SENTINEL_REBALANCE_INTERVAL_SECS",
                HotSetSettings::default().rebalance_interval,
            )
            .max(MIN_REBALANCE_INTERVAL),
            subscribe_cooldown: parse_env_duration_secs(
                "SENTINEL_SUBSCRIBE_COOLDOWN_SECS",
                HotSetSettings::default().subscribe_cooldown,
            ),
            weights: ScoringWeights {
                proximity: parse_env_f64(
                    "SENTINEL_WEIGHT_PROXIMITY",
                    ScoringWeights::default().proximity,
                ),
                volatility: parse_env_f64(
                    "SENTINEL_WEIGHT_VOLATILITY",
                    ScoringWeights::default().volatility,
                ),
                traded_value: parse_env_f64(
                    "SENTINEL_WEIGHT_TRADED_VALUE",
                    ScoringWeights::default().traded_value,
                ),
            },
        };

        let signal = SignalSettings {
            disparity_threshold: parse_env_f64(
                "SENTINEL_DISPARITY_THRESHOLD",
                SignalSettings::default().disparity_threshold,
            ),
            drop_threshold: parse_env_f64(
                "SENTINEL_DROP_THRESHOLD",
                SignalSettings::default().drop_threshold,
            ),
            drop_window: parse_env_duration_secs(
                "SENTINEL_DROP_WINDOW_SECS",
                SignalSettings::default().drop_window,
            ),
            alert_cooldown: parse_env_duration_secs(
                "SENTINEL_ALERT_COOLDOWN_SECS",
                SignalSettings::default().alert_cooldown,
            ),
        };

        let stream = StreamSettings {
            tick_queue_capacity: parse_env_usize(
                "SENTINEL_TICK_QUEUE_CAPACITY",
                StreamSettings::default().tick_queue_capacity,
            ),
            read_timeout: parse_env_duration_secs(
                "SENTINEL_STREAM_READ_TIMEOUT_SECS",
                StreamSettings::default().read_timeout,
            ),
            control_pacing: parse_env_duration_millis(
                "SENTINEL_CONTROL_PACING_MS",
                StreamSettings::default().control_pacing,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                "SENTINEL_RECONNECT_DELAY_INITIAL_MS",
                StreamSettings::default().reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "SENTINEL_RECONNECT_DELAY_MAX_SECS",
                StreamSettings::default().reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "SENTINEL_RECONNECT_DELAY_MULTIPLIER",
                StreamSettings::default().reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env_u32(
                "SENTINEL_MAX_RECONNECT_ATTEMPTS",
                StreamSettings::default().max_reconnect_attempts,
            ),
            overflow_policy: std::env::var("SENTINEL_OVERFLOW_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(StreamSettings::default().overflow_policy),
        };

        let store = StoreSettings {
            db_path: std::env::var("SENTINEL_DB_PATH")
                .unwrap_or_else(|_| StoreSettings::default().db_path),
            token_cache_path: std::env::var("SENTINEL_TOKEN_CACHE_PATH")
                .unwrap_or_else(|_| StoreSettings::default().token_cache_path),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                "SENTINEL_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let alerts = AlertSettings {
            webhook_url: std::env::var("SENTINEL_ALERT_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.is_empty()),
        };

        Ok(Self {
            environment,
            credentials: Credentials::new(app_key, app_secret),
            transport,
            scan,
            hotset,
            signal,
            stream,
            store,
            server,
            alerts,
        })
    }

    /// Get the REST API base URL for the configured environment.
    #[must_use]
    pub fn rest_base_url(&self) -> String {
        if self.environment.is_live() {
            "https://openapi.koreainvestment.com:9443".to_string()
        } else {
            "https://openapivts.koreainvestment.com:29443".to_string()
        }
    }

    /// Get the streaming WebSocket URL for the configured environment.
    #[must_use]
    pub fn ws_url(&self) -> String {
        if self.environment.is_live() {
            "ws://ops.koreainvestment.com:21000".to_string()
        } else {
            "ws://ops.koreainvestment.com:31000".to_string()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
