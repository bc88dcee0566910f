//! Connection lifecycle tests against a real local WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use beacon_core::{ClientFrame, ConnectionState, ServerFrame};
use beacon_engine::{ConnectionManager, EngineConfig, StaticAuthProvider};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestServer {
    port: u16,
    received: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
}

/// Accept loop recording every text frame. Optionally answers pings and
/// greets each connection with a canned frame.
async fn start_server(respond_pong: bool, greeting: Option<&'static str>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should work");
    let port = listener.local_addr().expect("local addr").port();
    let (record_tx, received) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let record_tx = record_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                let (mut writer, mut reader) = ws.split();
                if let Some(greeting) = greeting {
                    let _ = writer.send(WsMessage::text(greeting)).await;
                }
                while let Some(Ok(message)) = reader.next().await {
                    if let WsMessage::Text(text) = message {
                        let is_ping = text.as_str().contains("\"ping\"");
                        let _ = record_tx.send(text.to_string());
                        if respond_pong && is_ping {
                            let _ = writer.send(WsMessage::text(r#"{"type":"pong"}"#)).await;
                        }
                    }
                }
            });
        }
    });

    TestServer {
        port,
        received,
        connections,
    }
}

fn config_for(port: u16, overrides: &[(&str, &str)]) -> EngineConfig {
    let mut config = EngineConfig::new(
        format!("ws://127.0.0.1:{port}"),
        format!("http://127.0.0.1:{port}"),
    )
    .expect("config should build");
    for (key, value) in overrides {
        match *key {
            "heartbeat" => config.heartbeat_interval_ms = value.parse().expect("number"),
            "pong" => config.pong_timeout_ms = value.parse().expect("number"),
            "base" => config.reconnect_base_delay_ms = value.parse().expect("number"),
            "attempts" => config.reconnect_max_attempts = value.parse().expect("number"),
            other => panic!("unknown override {other}"),
        }
    }
    config
}

fn manager(config: &EngineConfig) -> Arc<ConnectionManager> {
    ConnectionManager::new(config, Arc::new(StaticAuthProvider::new("tok-1", "u_me")))
}

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<ConnectionState>,
    wanted: ConnectionState,
) {
    timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow() == wanted {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state channel closed before reaching {wanted:?}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

#[tokio::test]
async fn connect_is_idempotent_while_open() {
    let server = start_server(true, None).await;
    let config = config_for(server.port, &[]);
    let conn = manager(&config);

    conn.connect().await.expect("first connect should work");
    conn.connect().await.expect("second connect should no-op");
    sleep(Duration::from_millis(200)).await;

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_disconnect_preserves_joins_and_replays_them_on_reconnect() {
    let mut server = start_server(true, None).await;
    let config = config_for(server.port, &[]);
    let conn = manager(&config);

    conn.connect().await.expect("connect should work");
    conn.join_conversation("c_x").await;
    conn.join_conversation("c_y").await;

    conn.disconnect_for_idle("idle timeout").await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    conn.connect().await.expect("reconnect should work");

    // Two joins from the first session, two replayed on reconnect.
    let mut joins = Vec::new();
    while joins.len() < 4 {
        let frame = timeout(Duration::from_secs(5), server.received.recv())
            .await
            .expect("frame timeout")
            .expect("server closed");
        if frame.contains("join_channel") {
            joins.push(frame);
        }
    }

    let replayed: Vec<&String> = joins.iter().skip(2).collect();
    assert!(replayed.iter().any(|f| f.contains("c_x")));
    assert!(replayed.iter().any(|f| f.contains("c_y")));
    assert_eq!(conn.joined_conversations().await.len(), 2);
}

#[tokio::test]
async fn user_disconnect_suppresses_reconnect_and_clears_joins() {
    let server = start_server(true, None).await;
    let config = config_for(server.port, &[("base", "10")]);
    let conn = manager(&config);

    conn.connect().await.expect("connect should work");
    conn.join_conversation("c_x").await;
    conn.disconnect().await;

    sleep(Duration::from_millis(500)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(conn.joined_conversations().await.is_empty());
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inbound_frames_fan_out_and_fire_the_activity_pulse() {
    let server = start_server(
        true,
        Some(
            r#"{
                "type": "new_message",
                "channel_id": "c_1",
                "message": {
                    "id": "m_1",
                    "user_id": "u_2",
                    "content": "hello",
                    "created_at": "2025-11-07T12:00:00Z"
                }
            }"#,
        ),
    )
    .await;
    let config = config_for(server.port, &[]);
    let conn = manager(&config);

    let mut frames = conn.frames();
    let mut pulse = conn.activity_pulse();
    conn.connect().await.expect("connect should work");

    let frame = timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("frame timeout")
        .expect("frame receive");
    match frame {
        ServerFrame::NewMessage { message, .. } => assert_eq!(message.id, "m_1"),
        other => panic!("unexpected frame: {other:?}"),
    }

    timeout(Duration::from_secs(5), pulse.recv())
        .await
        .expect("pulse timeout")
        .expect("pulse receive");
}

#[tokio::test]
async fn outbound_frames_reach_the_server() {
    let mut server = start_server(true, None).await;
    let config = config_for(server.port, &[]);
    let conn = manager(&config);

    conn.connect().await.expect("connect should work");
    let sent = conn
        .send(&ClientFrame::SendMessage {
            channel_id: "c_1".into(),
            content: "hello".into(),
            parent_id: None,
            temp_id: Some("local-1".into()),
            attachment_ids: None,
        })
        .await;
    assert!(sent);

    let frame = timeout(Duration::from_secs(5), server.received.recv())
        .await
        .expect("frame timeout")
        .expect("server closed");
    assert!(frame.contains("\"type\":\"send_message\""));
    assert!(frame.contains("local-1"));
}

#[tokio::test]
async fn missing_pong_forces_a_close_and_enters_the_reconnect_path() {
    // Server never answers pings.
    let server = start_server(false, None).await;
    let config = config_for(server.port, &[("heartbeat", "100"), ("pong", "100")]);
    let conn = manager(&config);

    let mut states = conn.state_stream();
    conn.connect().await.expect("connect should work");
    wait_for_state(&mut states, ConnectionState::Connected).await;

    // Ping at ~100ms, pong timeout at ~200ms, then the reconnect schedule.
    wait_for_state(&mut states, ConnectionState::Reconnecting).await;
}

#[tokio::test]
async fn exhausted_reconnect_budget_surfaces_a_fatal_error() {
    // No server at all: every connect attempt fails.
    let config = config_for(1, &[("base", "10"), ("attempts", "2")]);
    let conn = manager(&config);
    let mut errors = conn.connectivity_errors();

    let _ = conn.connect().await;

    let error = timeout(Duration::from_secs(10), errors.recv())
        .await
        .expect("fatal error timeout")
        .expect("fatal error receive");
    assert_eq!(error.code, "reconnect_exhausted");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}
