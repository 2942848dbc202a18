#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Sentinel - Hybrid Market Data Watcher
//!
//! Polls a full equity universe over batched REST, promotes the most
//! interesting symbols into a bounded WebSocket "hot set" for tick-level
//! streaming, and raises deduplicated trading alerts.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure market data types and decision logic
//!   - `market`: Quote samples, snapshots, ticks, alerts
//!   - `hotset`: Symbol scoring and rebalance planning
//!   - `signal`: Alert condition evaluation with cooldowns
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Market feed, stream control, state store, alert sink
//!   - `scanner`: Batched universe scanning
//!   - `pipeline`: Long-running scan, rebalance, and tick loops
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kis`: KIS Open API REST transport and streaming client
//!   - `store`: Durable state on a local Turso database
//!   - `notify`: Webhook alert delivery
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! KIS REST ──▶ Scanner ──▶ Snapshot ──▶ Hot-set Rebalancer
//!                             │                │
//!                             ▼                ▼
//!                       Signal Engine ◀── KIS WebSocket
//!                             │
//!                             ▼
//!                        Alert Sink
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types and decision logic.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::hotset::{RebalancePlan, ScoringWeights, rank_snapshot, select_targets};
pub use domain::market::{
    AlertKind, AlertRecord, CooldownReason, QuoteSample, Snapshot, Symbol, SymbolInfo, Tick,
};
pub use domain::signal::{SignalConfig, SignalEngine};

// Application
pub use application::pipeline::{DegradeState, OverflowPolicy, PipelineConfig, PipelineError};
pub use application::ports::{
    AlertSink, ControlError, FeedError, MarketFeed, StateStore, StoreError, StreamControl,
};
pub use application::scanner::{ScanOutcome, Scanner, ScannerSettings};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, Environment, SentinelConfig};

// KIS adapters (for integration tests)
pub use infrastructure::kis::auth::TokenManager;
pub use infrastructure::kis::stream::{StreamClient, StreamClientConfig, StreamHandle};
pub use infrastructure::kis::transport::{KisMarketFeed, RestTransport, TransportError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// State store
pub use infrastructure::store::TursoStateStore;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::init as init_telemetry;
