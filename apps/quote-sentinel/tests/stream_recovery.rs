//! Stream client behavior against a local fake gateway.
//!
//! Spins up a real WebSocket listener, drives the client through
//! subscribe commands, data frames, and a forced disconnect, and checks
//! that the subscription set is replayed in full after reconnection.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quote_sentinel::application::ports::{ControlError, StreamControl};
use quote_sentinel::domain::hotset::RebalancePlan;
use quote_sentinel::infrastructure::config::{Credentials, StreamSettings};
use quote_sentinel::infrastructure::kis::auth::TokenManager;
use quote_sentinel::infrastructure::kis::stream::{StreamClient, StreamClientConfig};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// One control frame observed by the fake gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ControlSeen {
    session: u32,
    tr_type: String,
    tr_key: String,
}

/// Fake gateway behavior knobs.
struct GatewayOptions {
    /// Drop the first connection after this many control frames.
    drop_first_session_after: Option<usize>,
    /// Data frames to push after each control frame on session 2+.
    push_tick: bool,
}

async fn spawn_gateway(options: GatewayOptions) -> (SocketAddr, mpsc::UnboundedReceiver<ControlSeen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut session = 0_u32;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            session += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };

            let mut frames_seen = 0_usize;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let value: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        let tr_type = value["header"]["tr_type"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        let tr_key = value["body"]["input"]["tr_key"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        let _ = tx.send(ControlSeen {
                            session,
                            tr_type,
                            tr_key: tr_key.clone(),
                        });
                        frames_seen += 1;

                        if session == 1
                            && let Some(limit) = options.drop_first_session_after
                            && frames_seen >= limit
                        {
                            // Simulate an abrupt upstream drop.
                            break;
                        }

                        if options.push_tick && session >= 2 {
                            let frame = format!("0|H0STCNT0|1|{tr_key}^093015^71300");
                            let _ = ws.send(Message::Text(frame.into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    });

    (addr, rx)
}

fn settings() -> StreamSettings {
    StreamSettings {
        tick_queue_capacity: 64,
        read_timeout: Duration::from_secs(5),
        control_pacing: Duration::from_millis(1),
        reconnect_delay_initial: Duration::from_millis(10),
        reconnect_delay_max: Duration::from_millis(50),
        reconnect_delay_multiplier: 2.0,
        max_reconnect_attempts: 0,
        overflow_policy: quote_sentinel::application::pipeline::OverflowPolicy::DropOldest,
    }
}

async fn approval_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/Approval"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "approval_key": "test-approval" })),
        )
        .mount(&server)
        .await;
    server
}

fn tokens_for(server: &MockServer, dir: &tempfile::TempDir) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        Credentials::new("key".to_string(), "secret".to_string()),
        server.uri(),
        dir.path().join("token.json"),
    ))
}

async fn next_control(
    rx: &mut mpsc::UnboundedReceiver<ControlSeen>,
) -> ControlSeen {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for control frame")
        .expect("gateway channel closed")
}

#[tokio::test]
async fn apply_sends_paced_subscribe_frames() {
    let approval = approval_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, mut seen) = spawn_gateway(GatewayOptions {
        drop_first_session_after: None,
        push_tick: false,
    })
    .await;

    let cancel = CancellationToken::new();
    let (client, handle, _ticks) = StreamClient::new(
        StreamClientConfig {
            url: format!("ws://{addr}"),
            settings: settings(),
            max_subscriptions: 10,
        },
        tokens_for(&approval, &dir),
        reqwest::Client::new(),
        BTreeSet::new(),
        cancel.clone(),
    );
    tokio::spawn(client.run());

    let plan = RebalancePlan {
        subscribe: BTreeSet::from(["000660".to_string(), "005930".to_string()]),
        unsubscribe: BTreeSet::new(),
    };
    handle.apply(plan).await.unwrap();

    let first = next_control(&mut seen).await;
    let second = next_control(&mut seen).await;
    assert_eq!(first.tr_type, "1");
    assert_eq!(second.tr_type, "1");
    assert_eq!(
        BTreeSet::from([first.tr_key, second.tr_key]),
        BTreeSet::from(["000660".to_string(), "005930".to_string()])
    );
    assert_eq!(
        handle.current(),
        BTreeSet::from(["000660".to_string(), "005930".to_string()])
    );

    cancel.cancel();
}

#[tokio::test]
async fn reconnect_replays_the_full_subscription_set() {
    let approval = approval_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, mut seen) = spawn_gateway(GatewayOptions {
        drop_first_session_after: Some(2),
        push_tick: false,
    })
    .await;

    let initial = BTreeSet::from(["000660".to_string(), "005930".to_string()]);
    let cancel = CancellationToken::new();
    let (client, handle, _ticks) = StreamClient::new(
        StreamClientConfig {
            url: format!("ws://{addr}"),
            settings: settings(),
            max_subscriptions: 10,
        },
        tokens_for(&approval, &dir),
        reqwest::Client::new(),
        initial.clone(),
        cancel.clone(),
    );
    tokio::spawn(client.run());

    // Session 1 receives the replay, then the gateway drops the socket.
    let mut session1_keys = BTreeSet::new();
    for _ in 0..2 {
        let frame = next_control(&mut seen).await;
        assert_eq!(frame.session, 1);
        assert_eq!(frame.tr_type, "1");
        session1_keys.insert(frame.tr_key);
    }
    assert_eq!(session1_keys, initial);

    // Session 2 must replay the complete set, unprompted.
    let mut session2_keys = BTreeSet::new();
    for _ in 0..2 {
        let frame = next_control(&mut seen).await;
        assert_eq!(frame.session, 2);
        assert_eq!(frame.tr_type, "1");
        session2_keys.insert(frame.tr_key);
    }
    assert_eq!(session2_keys, initial);
    assert_eq!(handle.current(), initial);

    cancel.cancel();
}

#[tokio::test]
async fn data_frames_become_ticks() {
    let approval = approval_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, mut seen) = spawn_gateway(GatewayOptions {
        drop_first_session_after: Some(1),
        push_tick: true,
    })
    .await;

    let initial = BTreeSet::from(["005930".to_string()]);
    let cancel = CancellationToken::new();
    let (client, _handle, mut ticks) = StreamClient::new(
        StreamClientConfig {
            url: format!("ws://{addr}"),
            settings: settings(),
            max_subscriptions: 10,
        },
        tokens_for(&approval, &dir),
        reqwest::Client::new(),
        initial,
        cancel.clone(),
    );
    tokio::spawn(client.run());

    // Session 1 is dropped immediately; session 2 echoes a tick after the
    // replayed subscribe.
    let _ = next_control(&mut seen).await;
    let _ = next_control(&mut seen).await;

    let tick = tokio::time::timeout(Duration::from_secs(3), ticks.recv())
        .await
        .expect("timed out waiting for tick")
        .expect("tick channel closed");
    assert_eq!(tick.symbol, "005930");
    assert_eq!(tick.price, dec!(71300));

    cancel.cancel();
}

#[tokio::test]
async fn oversized_plan_is_rejected_without_breaking_the_stream() {
    let approval = approval_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (addr, mut seen) = spawn_gateway(GatewayOptions {
        drop_first_session_after: None,
        push_tick: false,
    })
    .await;

    let cancel = CancellationToken::new();
    let (client, handle, _ticks) = StreamClient::new(
        StreamClientConfig {
            url: format!("ws://{addr}"),
            settings: settings(),
            max_subscriptions: 1,
        },
        tokens_for(&approval, &dir),
        reqwest::Client::new(),
        BTreeSet::new(),
        cancel.clone(),
    );
    tokio::spawn(client.run());

    let oversized = RebalancePlan {
        subscribe: BTreeSet::from(["000660".to_string(), "005930".to_string()]),
        unsubscribe: BTreeSet::new(),
    };
    assert!(matches!(
        handle.apply(oversized).await,
        Err(ControlError::Rejected { .. })
    ));
    assert!(handle.current().is_empty());

    // A plan within the cap still goes through on the same connection.
    let fitting = RebalancePlan {
        subscribe: BTreeSet::from(["005930".to_string()]),
        unsubscribe: BTreeSet::new(),
    };
    handle.apply(fitting).await.unwrap();
    let frame = next_control(&mut seen).await;
    assert_eq!(frame.tr_key, "005930");
    assert_eq!(handle.current(), BTreeSet::from(["005930".to_string()]));

    cancel.cancel();
}
