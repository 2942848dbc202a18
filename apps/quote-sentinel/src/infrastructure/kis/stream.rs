//! Streaming WebSocket Client
//!
//! Maintains the live tick connection to the KIS streaming gateway.
//!
//! # Lifecycle
//!
//! Connect, fetch a fresh approval key, replay the full subscription set
//! (paced, one control frame per symbol), then serve the live loop until
//! the connection drops or shutdown is requested. Every reconnect runs the
//! same replay, so the live set always matches the tracked set.
//!
//! # Control flow
//!
//! The rebalance loop drives subscriptions through [`StreamHandle`], which
//! queues plans onto the client's command channel. A plan that would push
//! the live set over the configured cap is rejected without touching the
//! connection. Ticks fan out through a bounded broadcast channel; when a
//! consumer lags, the channel drops oldest first.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ControlError, StreamControl};
use crate::domain::hotset::RebalancePlan;
use crate::domain::market::{Symbol, Tick};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::kis::auth::{AuthError, TokenManager};
use crate::infrastructure::kis::codec::{CodecError, KisFrame, decode_frame};
use crate::infrastructure::kis::messages::{ControlRequest, ControlResponse};
use crate::infrastructure::kis::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::metrics::record_stream_reconnect;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the stream client.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Approval key issuance failed.
    #[error("approval key request failed: {0}")]
    Auth(#[from] AuthError),

    /// No frame arrived within the read timeout.
    #[error("stream idle past read timeout")]
    IdleTimeout,

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// TCP/TLS and approval-key handshake in progress.
    Connecting,
    /// Connected, replaying the subscription set.
    Subscribing,
    /// Serving live ticks.
    Live,
    /// Waiting out the backoff delay before the next connection attempt.
    Reconnecting,
}

impl ConnectionState {
    /// State name for health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Shared, observable stream status.
#[derive(Debug, Default)]
pub struct FeedStatus {
    state: RwLock<ConnectionState>,
    reconnects: AtomicU64,
}

impl FeedStatus {
    fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconnect attempts since startup.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Commands and Handle
// =============================================================================

enum StreamCommand {
    Apply(RebalancePlan, oneshot::Sender<Result<(), ControlError>>),
}

/// Handle through which the rebalance loop drives the stream.
#[derive(Clone)]
pub struct StreamHandle {
    commands: mpsc::Sender<StreamCommand>,
    subscriptions: Arc<RwLock<BTreeSet<Symbol>>>,
    status: Arc<FeedStatus>,
}

impl StreamHandle {
    /// Shared stream status, for health reporting.
    #[must_use]
    pub fn status(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.status)
    }
}

#[async_trait]
impl StreamControl for StreamHandle {
    fn current(&self) -> BTreeSet<Symbol> {
        self.subscriptions.read().clone()
    }

    async fn apply(&self, plan: RebalancePlan) -> Result<(), ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Apply(plan, reply_tx))
            .await
            .map_err(|_| ControlError::Closed)?;
        reply_rx.await.map_err(|_| ControlError::Closed)?
    }
}

// =============================================================================
// Client
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// WebSocket URL of the streaming gateway.
    pub url: String,
    /// Stream tunables.
    pub settings: StreamSettings,
    /// Hard cap on concurrent subscriptions.
    pub max_subscriptions: usize,
}

struct StreamCore {
    config: StreamClientConfig,
    tokens: Arc<TokenManager>,
    http: reqwest::Client,
    ticks: broadcast::Sender<Tick>,
    subscriptions: Arc<RwLock<BTreeSet<Symbol>>>,
    status: Arc<FeedStatus>,
    cancel: CancellationToken,
}

/// Streaming WebSocket client with automatic reconnection.
pub struct StreamClient {
    core: StreamCore,
    commands: mpsc::Receiver<StreamCommand>,
}

impl StreamClient {
    /// Create a client with an initial subscription set (restored from the
    /// state store).
    ///
    /// Returns the client, the control handle, and a tick receiver.
    #[must_use]
    pub fn new(
        config: StreamClientConfig,
        tokens: Arc<TokenManager>,
        http: reqwest::Client,
        initial: BTreeSet<Symbol>,
        cancel: CancellationToken,
    ) -> (Self, StreamHandle, broadcast::Receiver<Tick>) {
        let (tick_tx, tick_rx) = broadcast::channel(config.settings.tick_queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(16);
        let subscriptions = Arc::new(RwLock::new(initial));
        let status = Arc::new(FeedStatus::default());

        let handle = StreamHandle {
            commands: command_tx,
            subscriptions: Arc::clone(&subscriptions),
            status: Arc::clone(&status),
        };
        let client = Self {
            core: StreamCore {
                config,
                tokens,
                http,
                ticks: tick_tx,
                subscriptions,
                status,
                cancel,
            },
            commands: command_rx,
        };
        (client, handle, tick_rx)
    }

    /// Run the connection loop until cancelled or retries are exhausted.
    pub async fn run(mut self) -> Result<(), StreamError> {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::from_stream_settings(
            &self.core.config.settings,
        ));

        loop {
            if self.core.cancel.is_cancelled() {
                tracing::info!("stream client cancelled");
                self.core.status.set(ConnectionState::Disconnected);
                return Ok(());
            }

            match self.core.session(&mut self.commands, &mut policy).await {
                Ok(()) => {
                    tracing::info!("stream connection closed gracefully");
                    self.core.status.set(ConnectionState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream connection error");

                    if let Some(delay) = policy.next_delay() {
                        let attempt = policy.attempt_count();
                        record_stream_reconnect();
                        self.core.status.set(ConnectionState::Reconnecting);
                        self.core.status.note_reconnect();
                        tracing::info!(
                            attempt,
                            delay_ms = delay.as_millis(),
                            "reconnecting to stream"
                        );
                        tokio::select! {
                            () = self.core.cancel.cancelled() => {
                                tracing::info!("stream client cancelled during reconnect delay");
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        self.core.status.set(ConnectionState::Disconnected);
                        return Err(StreamError::MaxReconnectAttemptsExceeded);
                    }
                }
            }
        }
    }
}

impl StreamCore {
    /// Connect, replay subscriptions, and serve until error or shutdown.
    async fn session(
        &self,
        commands: &mut mpsc::Receiver<StreamCommand>,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), StreamError> {
        self.status.set(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "connecting to stream");

        let approval_key = self.tokens.ws_approval_key(&self.http).await?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Full replay of the tracked set; partial state after a drop is
        // never trusted.
        self.status.set(ConnectionState::Subscribing);
        let replay = self.subscriptions.read().clone();
        for symbol in &replay {
            let frame = ControlRequest::subscribe(&approval_key, symbol);
            self.send_control(&mut write, &frame).await?;
            if self.pace().await.is_err() {
                return Ok(());
            }
        }
        tracing::info!(count = replay.len(), "subscription set replayed");

        self.status.set(ConnectionState::Live);
        policy.reset();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                command = commands.recv() => {
                    match command {
                        Some(StreamCommand::Apply(plan, reply)) => {
                            match self.apply_plan(&mut write, &approval_key, plan).await {
                                Ok(()) => {
                                    let _ = reply.send(Ok(()));
                                }
                                Err(ApplyError::Rejected(reason)) => {
                                    let _ = reply.send(Err(ControlError::Rejected { reason }));
                                }
                                Err(ApplyError::Stream(e)) => {
                                    let _ = reply.send(Err(ControlError::Closed));
                                    return Err(e);
                                }
                            }
                        }
                        None => {
                            // All handles dropped; nothing can drive us anymore.
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                next = tokio::time::timeout(self.config.settings.read_timeout, read.next()) => {
                    match next {
                        Err(_) => return Err(StreamError::IdleTimeout),
                        Ok(None) => {
                            tracing::info!("stream ended");
                            return Err(StreamError::ConnectionClosed);
                        }
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.handle_text(&text, &mut write).await?;
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            tracing::info!("server sent close frame");
                            return Err(StreamError::ConnectionClosed);
                        }
                        Ok(Some(Ok(_))) => {
                            // Binary and pong frames are not part of the protocol.
                        }
                    }
                }
            }
        }
    }

    async fn handle_text<W>(&self, text: &str, write: &mut W) -> Result<(), StreamError>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match decode_frame(text, Utc::now()) {
            Ok(KisFrame::Ticks(ticks)) => {
                for tick in ticks {
                    // No receivers is fine during shutdown.
                    let _ = self.ticks.send(tick);
                }
            }
            Ok(KisFrame::Control(response)) => {
                if response.is_pingpong() {
                    // The gateway expects its keepalive echoed verbatim.
                    write.send(Message::Text(text.to_string().into())).await?;
                } else {
                    self.handle_control_ack(&response);
                }
            }
            Err(CodecError::UnsupportedTr(tr_id)) => {
                tracing::debug!(tr_id, "ignoring frame for unsubscribed tr");
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame dropped");
            }
        }
        Ok(())
    }

    fn handle_control_ack(&self, response: &ControlResponse) {
        let Some(body) = &response.body else {
            return;
        };
        if body.rt_cd == "0" {
            tracing::debug!(
                symbol = %response.header.tr_key,
                msg = %body.msg1,
                "control ack"
            );
        } else {
            // A refused subscription must not linger in the tracked set.
            tracing::warn!(
                symbol = %response.header.tr_key,
                msg_cd = %body.msg_cd,
                msg = %body.msg1,
                "control request refused"
            );
            if !response.header.tr_key.is_empty() {
                self.subscriptions.write().remove(&response.header.tr_key);
            }
        }
    }

    async fn apply_plan<W>(
        &self,
        write: &mut W,
        approval_key: &str,
        plan: RebalancePlan,
    ) -> Result<(), ApplyError>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        {
            let current = self.subscriptions.read();
            let removed = plan.unsubscribe.intersection(&current).count();
            let added = plan
                .subscribe
                .iter()
                .filter(|s| !current.contains(*s))
                .count();
            let resulting = current.len() - removed + added;
            if resulting > self.max_subscriptions() {
                return Err(ApplyError::Rejected(format!(
                    "plan would reach {resulting} subscriptions, cap is {}",
                    self.max_subscriptions()
                )));
            }
        }

        for symbol in &plan.unsubscribe {
            let frame = ControlRequest::unsubscribe(approval_key, symbol);
            self.send_control(write, &frame).await?;
            self.subscriptions.write().remove(symbol);
            if self.pace().await.is_err() {
                return Ok(());
            }
        }
        for symbol in &plan.subscribe {
            let frame = ControlRequest::subscribe(approval_key, symbol);
            self.send_control(write, &frame).await?;
            self.subscriptions.write().insert(symbol.clone());
            if self.pace().await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn send_control<W>(&self, write: &mut W, frame: &ControlRequest) -> Result<(), StreamError>
    where
        W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let json = serde_json::to_string(frame)
            .map_err(|e| StreamError::Auth(AuthError::Malformed(e.to_string())))?;
        write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Pace between control frames; Err means shutdown fired.
    async fn pace(&self) -> Result<(), ()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(()),
            () = tokio::time::sleep(self.config.settings.control_pacing) => Ok(()),
        }
    }

    const fn max_subscriptions(&self) -> usize {
        self.config.max_subscriptions
    }
}

impl From<StreamError> for ApplyError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

/// Internal result of applying a plan on a live connection.
enum ApplyError {
    /// The plan was refused; the connection is still healthy.
    Rejected(String),
    /// The connection failed while applying.
    Stream(StreamError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_names() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionState::Live.as_str(), "live");
    }

    #[test]
    fn feed_status_tracks_state_and_reconnects() {
        let status = FeedStatus::default();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        status.set(ConnectionState::Live);
        assert_eq!(status.state(), ConnectionState::Live);
        status.note_reconnect();
        status.note_reconnect();
        assert_eq!(status.reconnects(), 2);
    }

    #[tokio::test]
    async fn handle_reports_closed_when_client_is_gone() {
        let settings = StreamSettings::default();
        let (client, handle, _ticks) = StreamClient::new(
            StreamClientConfig {
                url: "ws://localhost:1".to_string(),
                settings,
                max_subscriptions: 20,
            },
            Arc::new(TokenManager::new(
                crate::infrastructure::config::Credentials::new(
                    "key".to_string(),
                    "secret".to_string(),
                ),
                "http://localhost:1".to_string(),
                std::path::PathBuf::from("/tmp/never-written.json"),
            )),
            reqwest::Client::new(),
            BTreeSet::new(),
            CancellationToken::new(),
        );
        drop(client);

        let plan = RebalancePlan {
            subscribe: BTreeSet::from(["005930".to_string()]),
            unsubscribe: BTreeSet::new(),
        };
        assert!(matches!(
            handle.apply(plan).await,
            Err(ControlError::Closed)
        ));
    }
}
