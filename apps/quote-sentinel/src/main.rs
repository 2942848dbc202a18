//! Quote Sentinel Binary
//!
//! Starts the market data watcher.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-sentinel
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KIS_APP_KEY`: KIS Open API app key
//! - `KIS_APP_SECRET`: KIS Open API app secret
//!
//! ## Optional
//! - `SENTINEL_ENV`: PAPER | LIVE (default: PAPER)
//! - `SENTINEL_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `SENTINEL_DB_PATH`: Local state database path (default: sentinel.db)
//! - `SENTINEL_UNIVERSE_FILE`: JSON universe file used to seed an empty store
//! - `SENTINEL_ALERT_WEBHOOK_URL`: Alert webhook endpoint (default: log only)
//! - `SENTINEL_MAX_WS_SUBSCRIPTIONS`: Hot-set size cap (default: 20)
//! - `RUST_LOG`: Log level (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use quote_sentinel::application::pipeline::{
    self, DegradeState, PipelineConfig,
};
use quote_sentinel::application::ports::{AlertSink, StateStore, TracingAlertSink};
use quote_sentinel::application::scanner::{Scanner, ScannerSettings};
use quote_sentinel::domain::market::{AlertKind, Snapshot, SymbolInfo};
use quote_sentinel::domain::signal::{SignalConfig, SignalEngine};
use quote_sentinel::infrastructure::config::SentinelConfig;
use quote_sentinel::infrastructure::health::{HealthServer, HealthServerState};
use quote_sentinel::infrastructure::kis::auth::TokenManager;
use quote_sentinel::infrastructure::kis::stream::{StreamClient, StreamClientConfig};
use quote_sentinel::infrastructure::kis::transport::{KisMarketFeed, RestTransport};
use quote_sentinel::infrastructure::metrics::{init_metrics, set_active_subscriptions};
use quote_sentinel::infrastructure::notify::WebhookAlertSink;
use quote_sentinel::infrastructure::store::TursoStateStore;
use quote_sentinel::infrastructure::telemetry;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();
    telemetry::init();

    tracing::info!("starting quote sentinel");

    let _metrics_handle = init_metrics();

    let config = SentinelConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Durable state; the universe must exist before anything can scan.
    let store = Arc::new(
        TursoStateStore::open(&config.store.db_path)
            .await
            .with_context(|| format!("opening state database at {}", config.store.db_path))?,
    );
    let universe = Arc::new(load_universe(&store).await?);
    tracing::info!(symbols = universe.len(), "universe loaded");

    // Signal engine, with unexpired alert cooldowns restored.
    let engine = Arc::new(SignalEngine::new(SignalConfig {
        disparity_threshold: config.signal.disparity_threshold,
        drop_threshold: config.signal.drop_threshold,
        drop_window: config.signal.drop_window,
        alert_cooldown: config.signal.alert_cooldown,
    }));
    hydrate_alert_cooldowns(&store, &engine).await?;

    // REST side: token manager, transport, scanner.
    let tokens = Arc::new(TokenManager::new(
        config.credentials.clone(),
        config.rest_base_url(),
        PathBuf::from(&config.store.token_cache_path),
    ));
    let transport = Arc::new(RestTransport::new(
        config.transport.clone(),
        config.rest_base_url(),
        config.credentials.clone(),
        Arc::clone(&tokens),
        shutdown_token.clone(),
    ));
    let feed = Arc::new(KisMarketFeed::new(Arc::clone(&transport)));
    let scanner = Scanner::new(
        Arc::clone(&feed),
        ScannerSettings {
            batch_size: config.scan.batch_size,
            batch_gap: config.scan.batch_gap,
        },
    );

    // Stream side: restore the persisted hot set and start the client.
    let persisted = store.load_subscriptions().await?;
    if !persisted.is_empty() {
        tracing::info!(count = persisted.len(), "restored subscription set");
        set_active_subscriptions(persisted.len() as f64);
    }
    let (stream_client, stream_handle, tick_rx) = StreamClient::new(
        StreamClientConfig {
            url: config.ws_url(),
            settings: config.stream.clone(),
            max_subscriptions: config.hotset.max_ws_subscriptions,
        },
        Arc::clone(&tokens),
        transport.client(),
        persisted,
        shutdown_token.clone(),
    );

    // Alert delivery: webhook when configured, log otherwise.
    let sink: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "alerts will be posted to webhook");
            Arc::new(WebhookAlertSink::new(transport.client(), url.clone()))
        }
        None => {
            tracing::info!("no webhook configured, alerts will be logged");
            Arc::new(TracingAlertSink::new())
        }
    };

    let degrade = Arc::new(DegradeState::new());
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
    let pipeline_config = PipelineConfig {
        scan_interval: config.scan.interval,
        rebalance_interval: config.hotset.rebalance_interval,
        max_ws_subscriptions: config.hotset.max_ws_subscriptions,
        subscribe_cooldown: config.hotset.subscribe_cooldown,
        alert_cooldown: config.signal.alert_cooldown,
        disparity_threshold: config.signal.disparity_threshold,
        weights: config.hotset.weights,
        overflow_policy: config.stream.overflow_policy,
        safe_mode_after_failures: 3,
    };

    // Health server.
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        stream_handle.clone(),
        Arc::clone(&degrade),
        snapshot_rx.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    // Spawn the stream client.
    tokio::spawn(async move {
        if let Err(e) = stream_client.run().await {
            tracing::error!(error = %e, "stream client error");
        }
    });

    // Spawn the scan loop. Its handle is kept: an error from it means the
    // credentials are unusable and the process must stop.
    let scan_task = tokio::spawn(pipeline::run_scan_loop(
        scanner,
        Arc::clone(&universe),
        Arc::clone(&engine),
        Arc::clone(&store),
        Arc::clone(&sink),
        snapshot_tx,
        Arc::clone(&degrade),
        pipeline_config,
        shutdown_token.clone(),
    ));

    // Spawn the rebalance loop.
    tokio::spawn(pipeline::run_rebalance_loop(
        Arc::new(stream_handle),
        Arc::clone(&store),
        snapshot_rx,
        Arc::clone(&degrade),
        pipeline_config,
        shutdown_token.clone(),
    ));

    // Spawn the tick pump.
    tokio::spawn(pipeline::run_tick_pump(
        tick_rx,
        Arc::clone(&engine),
        Arc::clone(&store),
        Arc::clone(&sink),
        Arc::clone(&degrade),
        pipeline_config,
        shutdown_token.clone(),
    ));

    // Spawn the health server.
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "health server error");
        }
    });

    tracing::info!("quote sentinel ready");

    await_shutdown(shutdown_token, scan_task).await?;

    tracing::info!("quote sentinel stopped");
    Ok(())
}

/// Universe file entry, for seeding an empty store.
#[derive(Debug, Deserialize)]
struct UniverseEntry {
    code: String,
    name: String,
    #[serde(default)]
    ma25: Option<Decimal>,
}

/// Load the scan universe, seeding from `SENTINEL_UNIVERSE_FILE` when the
/// store is empty.
async fn load_universe(store: &TursoStateStore) -> anyhow::Result<Vec<SymbolInfo>> {
    let mut universe = store.load_universe().await?;

    if universe.is_empty()
        && let Ok(path) = std::env::var("SENTINEL_UNIVERSE_FILE")
    {
        tracing::info!(path = %path, "seeding universe from file");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading universe file {path}"))?;
        let entries: Vec<UniverseEntry> =
            serde_json::from_str(&raw).with_context(|| format!("parsing universe file {path}"))?;
        let seeded: Vec<SymbolInfo> = entries
            .into_iter()
            .map(|e| SymbolInfo {
                code: e.code,
                name: e.name,
                ma25: e.ma25,
            })
            .collect();
        store.replace_universe(&seeded).await?;
        universe = seeded;
    }

    anyhow::ensure!(
        !universe.is_empty(),
        "universe is empty: seed the store or set SENTINEL_UNIVERSE_FILE"
    );
    Ok(universe)
}

/// Restore unexpired alert cooldowns into the signal engine.
async fn hydrate_alert_cooldowns(
    store: &TursoStateStore,
    engine: &SignalEngine,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let mut restored = 0usize;
    for kind in AlertKind::all() {
        let active = store
            .active_cooldowns(
                &quote_sentinel::domain::market::CooldownReason::Alert(*kind),
                now,
            )
            .await?;
        restored += active.len();
        engine.hydrate_cooldowns(active.into_iter().map(|(symbol, until)| (symbol, *kind, until)));
    }
    if restored > 0 {
        tracing::info!(count = restored, "restored alert cooldowns");
    }
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SentinelConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        health_port = config.server.health_port,
        scan_interval_secs = config.scan.interval.as_secs(),
        batch_size = config.scan.batch_size,
        max_ws_subscriptions = config.hotset.max_ws_subscriptions,
        "configuration loaded"
    );
    tracing::debug!(
        rest_base_url = %config.rest_base_url(),
        ws_url = %config.ws_url(),
        "api endpoints"
    );
}

/// Wait for a shutdown signal (SIGTERM or SIGINT) or a fatal scan loop
/// exit, then cancel all tasks.
///
/// A scan loop error means authentication stopped working and is returned
/// so the process exits non-zero with the diagnostic.
#[allow(clippy::expect_used)]
async fn await_shutdown(
    shutdown_token: CancellationToken,
    scan_task: tokio::task::JoinHandle<Result<(), pipeline::PipelineError>>,
) -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("signal handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let result = tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT");
            Ok(())
        }
        () = terminate => {
            tracing::info!("received SIGTERM");
            Ok(())
        }
        joined = scan_task => match joined {
            Ok(Err(e)) => {
                tracing::error!(error = %e, "scan loop failed, shutting down");
                Err(anyhow::Error::new(e))
            }
            Ok(Ok(())) => {
                tracing::warn!("scan loop exited, shutting down");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("scan loop panicked: {e}")),
        },
    };

    shutdown_token.cancel();

    // Give tasks a moment to observe cancellation and flush.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    result
}
