//! WebSocket connection lifecycle: connect/close, heartbeat, backoff
//! reconnection, and idle-driven suspension.
//!
//! The manager owns the socket and its reader/writer/heartbeat tasks. It
//! never mutates domain state; decoded frames fan out to subscribers and the
//! sync engine reconciles them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{
    decode_frame, ClientFrame, ConnectionState, EngineError, ErrorCategory, RetryPolicy,
    ServerFrame,
};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::config::EngineConfig;

const NORMAL_CLOSURE_CODE: u16 = 1000;
const JITTER_MAX_MS: u64 = 1_000;
const OUTBOUND_BUFFER: usize = 64;
const FRAME_BUFFER: usize = 256;

/// Why the local side closed the socket. Expected closures suppress the
/// auto-reconnect path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    /// User-initiated; the join-set is cleared.
    User,
    /// Idle policy; the join-set is preserved for the next reconnect.
    Idle,
}

#[derive(Debug, Default)]
struct ConnInner {
    outbound: Option<mpsc::Sender<WsMessage>>,
    cancel: Option<CancellationToken>,
    reconnect_cancel: Option<CancellationToken>,
    joined: HashSet<String>,
    attempt: u32,
    disconnect_reason: Option<DisconnectReason>,
    /// Bumped on every install/teardown so stale socket tasks cannot apply
    /// their close handling to a newer socket.
    generation: u64,
}

/// Owner of the transport socket.
pub struct ConnectionManager {
    ws_base: String,
    heartbeat_interval: Duration,
    pong_timeout: Duration,
    policy: RetryPolicy,
    auth: Arc<dyn AuthProvider>,
    state_tx: watch::Sender<ConnectionState>,
    frame_tx: broadcast::Sender<ServerFrame>,
    pulse_tx: broadcast::Sender<()>,
    error_tx: broadcast::Sender<EngineError>,
    inner: Mutex<ConnInner>,
}

impl ConnectionManager {
    pub fn new(config: &EngineConfig, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (frame_tx, _) = broadcast::channel(FRAME_BUFFER);
        let (pulse_tx, _) = broadcast::channel(FRAME_BUFFER);
        let (error_tx, _) = broadcast::channel(16);

        Arc::new(Self {
            ws_base: config.ws_base.trim_end_matches('/').to_owned(),
            heartbeat_interval: config.heartbeat_interval(),
            pong_timeout: config.pong_timeout(),
            policy: config.retry_policy(),
            auth,
            state_tx,
            frame_tx,
            pulse_tx,
            error_tx,
            inner: Mutex::new(ConnInner::default()),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state transitions.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Decoded inbound frames (pong is consumed by the heartbeat).
    pub fn frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frame_tx.subscribe()
    }

    /// Fires on every inbound frame; drives the activity monitor's
    /// idle-from-server-traffic reset.
    pub fn activity_pulse(&self) -> broadcast::Receiver<()> {
        self.pulse_tx.subscribe()
    }

    /// Fatal connectivity errors (reconnect budget exhausted).
    pub fn connectivity_errors(&self) -> broadcast::Receiver<EngineError> {
        self.error_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.outbound.is_some()
    }

    /// Conversations joined on this connection, preserved across reconnects.
    pub async fn joined_conversations(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.joined.iter().cloned().collect()
    }

    /// Open the socket. Idempotent: a no-op while a socket is already open.
    pub async fn connect(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.outbound.is_some() {
                debug!("socket already connected");
                return Ok(());
            }
            // An explicit connect supersedes any earlier local-close intent.
            inner.disconnect_reason = None;
        }

        self.state_tx.send_replace(ConnectionState::Connecting);

        let token = match self.auth.access_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "token acquisition failed before connect");
                self.state_tx.send_replace(ConnectionState::Disconnected);
                self.schedule_reconnect();
                return Err(err);
            }
        };
        let Some(user_id) = self.auth.current_user_id() else {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(EngineError::new(
                ErrorCategory::Auth,
                "user_unavailable",
                "no active session user for socket connect",
            ));
        };

        let endpoint = format!("{}/ws/chat/?token={token}&user_id={user_id}", self.ws_base);
        match tokio_tungstenite::connect_async(&endpoint).await {
            Ok((stream, _)) => {
                self.install_socket(stream).await;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "socket connect failed");
                self.state_tx.send_replace(ConnectionState::Disconnected);
                self.schedule_reconnect();
                Err(EngineError::transport("socket_connect_error", err.to_string()))
            }
        }
    }

    /// User-initiated close: normal closure, join-set cleared, no reconnect.
    pub async fn disconnect(&self) {
        self.close_locally(DisconnectReason::User, "client disconnect")
            .await;
        let mut inner = self.inner.lock().await;
        inner.joined.clear();
        inner.attempt = 0;
    }

    /// Idle-policy close: normal closure, join-set preserved, the next
    /// auto-reconnect suppressed. The closure is expected, not an error.
    pub async fn disconnect_for_idle(&self, reason: &str) {
        let joined = { self.inner.lock().await.joined.len() };
        debug!(reason, joined, "disconnecting for idle");
        self.close_locally(DisconnectReason::Idle, reason).await;
    }

    /// Join a conversation's live channel. Tracked for replay on reconnect.
    pub async fn join_conversation(&self, conversation_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.joined.insert(conversation_id.to_owned());
        }
        self.send(&ClientFrame::JoinChannel {
            channel_id: conversation_id.to_owned(),
        })
        .await;
    }

    /// Leave a conversation's live channel.
    pub async fn leave_conversation(&self, conversation_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.joined.remove(conversation_id);
        }
        self.send(&ClientFrame::LeaveChannel {
            channel_id: conversation_id.to_owned(),
        })
        .await;
    }

    /// Encode and transmit one frame. Returns whether it was handed to an
    /// open socket; callers with durability requirements fall back to REST.
    pub async fn send(&self, frame: &ClientFrame) -> bool {
        let outbound = { self.inner.lock().await.outbound.clone() };
        let Some(outbound) = outbound else {
            warn!("cannot send frame: socket not connected");
            return false;
        };

        let encoded = match serde_json::to_string(frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "outbound frame failed to encode");
                return false;
            }
        };

        outbound.send(WsMessage::text(encoded)).await.is_ok()
    }

    async fn install_socket(
        self: &Arc<Self>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) {
        let (mut ws_writer, mut ws_reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let pong = Arc::new(Notify::new());

        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.outbound = Some(out_tx.clone());
            inner.cancel = Some(cancel.clone());
            inner.attempt = 0;
            inner.disconnect_reason = None;
            inner.generation
        };

        self.state_tx.send_replace(ConnectionState::Connected);
        info!("socket connected");

        // Writer: drains the outbound queue into the sink. A queued close
        // frame is flushed before cancellation is honored, then ends the task.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = out_rx.recv() => match next {
                        Some(message) => {
                            let is_close = matches!(message, WsMessage::Close(_));
                            if ws_writer.send(message).await.is_err() {
                                break;
                            }
                            if is_close {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_cancel.cancelled() => break,
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: decodes frames, feeds the pulse, and owns close handling.
        let manager = Arc::clone(self);
        let reader_cancel = cancel.clone();
        let reader_pong = Arc::clone(&pong);
        tokio::spawn(async move {
            let mut close_code: Option<u16> = None;
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = ws_reader.next() => match next {
                        Some(Ok(WsMessage::Text(text))) => {
                            match decode_frame(text.as_str()) {
                                Ok(frame) => {
                                    // Server-pushed traffic counts toward
                                    // "this connection is useful".
                                    let _ = manager.pulse_tx.send(());
                                    match frame {
                                        ServerFrame::Pong => reader_pong.notify_one(),
                                        frame => {
                                            let _ = manager.frame_tx.send(frame);
                                        }
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "dropping undecodable frame");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            close_code = frame.map(|f| u16::from(f.code));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "socket read error");
                            break;
                        }
                        None => break,
                    },
                }
            }

            manager.handle_closed(generation, close_code).await;
        });

        // Heartbeat: ping every interval, force-close on pong timeout.
        let manager = Arc::clone(self);
        let heartbeat_cancel = cancel;
        let heartbeat_out = out_tx;
        let heartbeat_pong = pong;
        let interval = self.heartbeat_interval;
        let pong_timeout = self.pong_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Ok(ping) = serde_json::to_string(&ClientFrame::Ping) else {
                            break;
                        };
                        if heartbeat_out.send(WsMessage::text(ping)).await.is_err() {
                            break;
                        }
                        tokio::select! {
                            _ = heartbeat_cancel.cancelled() => break,
                            _ = heartbeat_pong.notified() => {}
                            _ = tokio::time::sleep(pong_timeout) => {
                                warn!("ping timeout, forcing socket close");
                                manager.force_close(generation).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Re-issue joins for every conversation joined before a prior
        // disconnect.
        for conversation_id in self.joined_conversations().await {
            self.send(&ClientFrame::JoinChannel {
                channel_id: conversation_id,
            })
            .await;
        }
    }

    /// Reader-side close bookkeeping. Unexpected closures (abnormal code,
    /// not locally initiated) enter the reconnect path.
    async fn handle_closed(self: &Arc<Self>, generation: u64, close_code: Option<u16>) {
        let reason = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.outbound = None;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.disconnect_reason.take()
        };

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(?close_code, ?reason, "socket closed");

        if close_code == Some(NORMAL_CLOSURE_CODE) || reason.is_some() {
            return;
        }
        self.schedule_reconnect();
    }

    async fn force_close(&self, generation: u64) {
        let cancel = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.outbound = None;
            inner.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    async fn close_locally(&self, reason: DisconnectReason, message: &str) {
        let (outbound, cancel, reconnect_cancel) = {
            let mut inner = self.inner.lock().await;
            inner.disconnect_reason = Some(reason);
            inner.generation += 1;
            (
                inner.outbound.take(),
                inner.cancel.take(),
                inner.reconnect_cancel.take(),
            )
        };

        if let Some(reconnect_cancel) = reconnect_cancel {
            reconnect_cancel.cancel();
        }

        if let Some(outbound) = outbound {
            let close = WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: message.to_owned().into(),
            }));
            let _ = outbound.send(close).await;
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Schedule the next reconnect attempt with exponential backoff and
    /// jitter, or surface a fatal connectivity error once the attempt budget
    /// is spent.
    fn schedule_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reconnect_cancel = CancellationToken::new();
            let (attempt, delay) = {
                let mut inner = manager.inner.lock().await;
                inner.attempt += 1;
                let attempt = inner.attempt;
                let jitter = rand::thread_rng().gen_range(0..=JITTER_MAX_MS);
                match manager.policy.delay_for_attempt(attempt, jitter) {
                    Some(delay) => {
                        inner.reconnect_cancel = Some(reconnect_cancel.clone());
                        (attempt, delay)
                    }
                    None => {
                        error!("reconnect attempts exhausted");
                        let _ = manager.error_tx.send(EngineError::new(
                            ErrorCategory::Transport,
                            "reconnect_exhausted",
                            "unable to reconnect to chat server",
                        ));
                        return;
                    }
                }
            };

            manager.state_tx.send_replace(ConnectionState::Reconnecting);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                _ = reconnect_cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // An explicit close may have landed while the delay ran; an
            // expected closure never auto-reconnects.
            if manager.inner.lock().await.disconnect_reason.is_some() {
                debug!("skipping scheduled reconnect after local close");
                return;
            }

            let _ = manager.connect().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthProvider;

    fn manager() -> Arc<ConnectionManager> {
        let config = EngineConfig::new("ws://127.0.0.1:9", "http://127.0.0.1:9")
            .expect("config should build");
        ConnectionManager::new(&config, Arc::new(StaticAuthProvider::new("tok", "u_me")))
    }

    #[tokio::test]
    async fn starts_disconnected_with_empty_join_set() {
        let conn = manager();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected().await);
        assert!(conn.joined_conversations().await.is_empty());
    }

    #[tokio::test]
    async fn send_reports_failure_when_disconnected() {
        let conn = manager();
        let sent = conn
            .send(&ClientFrame::TypingStart {
                channel_id: "c_1".into(),
            })
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn join_set_tracks_membership_without_a_socket() {
        let conn = manager();
        conn.join_conversation("c_x").await;
        conn.join_conversation("c_y").await;
        conn.leave_conversation("c_x").await;

        assert_eq!(conn.joined_conversations().await, vec!["c_y".to_owned()]);
    }

    #[tokio::test]
    async fn user_disconnect_clears_joins_but_idle_disconnect_preserves_them() {
        let conn = manager();
        conn.join_conversation("c_x").await;
        conn.join_conversation("c_y").await;

        conn.disconnect_for_idle("idle timeout").await;
        let mut joined = conn.joined_conversations().await;
        joined.sort();
        assert_eq!(joined, vec!["c_x".to_owned(), "c_y".to_owned()]);

        conn.disconnect().await;
        assert!(conn.joined_conversations().await.is_empty());
    }
}
