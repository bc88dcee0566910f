//! Idle/active/hidden classification driving connection suspension.
//!
//! The host forwards raw input signals and tab visibility changes; the
//! monitor throttles them, maintains the inactivity deadline, and commands
//! the connection manager to suspend or resume. Server-pushed traffic also
//! resets the deadline: a connection carrying other users' chatter is still
//! useful even when the local user is quiet.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::IdleState;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::notify::NotificationCenter;

/// Qualifying local input signals, throttled to one per 100ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    PointerMove,
    KeyPress,
    Scroll,
    Touch,
    Click,
}

#[derive(Debug, Clone, Copy)]
enum MonitorSignal {
    Input(InputSignal),
    Visibility { visible: bool },
}

/// Handle to the monitor task.
pub struct ActivityMonitor {
    signal_tx: mpsc::UnboundedSender<MonitorSignal>,
    idle_rx: watch::Receiver<IdleState>,
    cancel: CancellationToken,
}

impl ActivityMonitor {
    pub fn spawn(
        conn: Arc<ConnectionManager>,
        notifications: Arc<NotificationCenter>,
        config: &EngineConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (idle_tx, idle_rx) = watch::channel(IdleState::Active);
        let cancel = CancellationToken::new();

        let task = MonitorTask {
            conn: Arc::clone(&conn),
            notifications,
            idle_timeout: config.idle_timeout(),
            throttle: config.input_throttle(),
            idle_tx,
            visible: true,
            user_active: true,
            disconnected_for_idle: false,
            last_input: None,
            idle_deadline: None,
        };
        let pulse_rx = conn.activity_pulse();
        tokio::spawn(task.run(signal_rx, pulse_rx, cancel.clone()));

        Self {
            signal_tx,
            idle_rx,
            cancel,
        }
    }

    /// Forward one qualifying input signal.
    pub fn record_input(&self, signal: InputSignal) {
        let _ = self.signal_tx.send(MonitorSignal::Input(signal));
    }

    /// Forward a tab visibility change.
    pub fn set_visibility(&self, visible: bool) {
        let _ = self.signal_tx.send(MonitorSignal::Visibility { visible });
    }

    pub fn idle_state(&self) -> IdleState {
        *self.idle_rx.borrow()
    }

    /// Observe idle state transitions. Repeated identical states do not
    /// re-emit.
    pub fn idle_stream(&self) -> watch::Receiver<IdleState> {
        self.idle_rx.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct MonitorTask {
    conn: Arc<ConnectionManager>,
    notifications: Arc<NotificationCenter>,
    idle_timeout: Duration,
    throttle: Duration,
    idle_tx: watch::Sender<IdleState>,
    visible: bool,
    user_active: bool,
    disconnected_for_idle: bool,
    last_input: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl MonitorTask {
    async fn run(
        mut self,
        mut signal_rx: mpsc::UnboundedReceiver<MonitorSignal>,
        mut pulse_rx: broadcast::Receiver<()>,
        cancel: CancellationToken,
    ) {
        self.reset_idle_deadline();
        let mut pulses_open = true;

        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signal_rx.recv() => match signal {
                    Some(MonitorSignal::Input(signal)) => self.on_input(signal).await,
                    Some(MonitorSignal::Visibility { visible }) => {
                        self.on_visibility(visible).await
                    }
                    None => break,
                },
                pulse = pulse_rx.recv(), if pulses_open => match pulse {
                    Ok(()) => self.on_server_activity(),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.on_server_activity(),
                    Err(broadcast::error::RecvError::Closed) => pulses_open = false,
                },
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
                ), if deadline.is_some() => {
                    self.on_idle_timeout().await;
                }
            }
        }
    }

    async fn on_input(&mut self, signal: InputSignal) {
        let now = Instant::now();
        if self
            .last_input
            .is_some_and(|last| now.duration_since(last) < self.throttle)
        {
            return;
        }
        self.last_input = Some(now);

        debug!(?signal, "activity detected");
        self.user_active = true;
        self.reset_idle_deadline();
        if self.disconnected_for_idle && self.visible {
            self.reconnect().await;
        }
    }

    async fn on_visibility(&mut self, visible: bool) {
        let was_visible = self.visible;
        self.visible = visible;
        debug!(visible, "visibility changed");

        if !visible {
            // No point tracking activity in a hidden tab.
            self.idle_deadline = None;
            self.set_state(IdleState::Hidden);

            if self.notifications.is_enabled() {
                debug!("tab hidden but notifications enabled, keeping connection alive");
            } else {
                self.disconnected_for_idle = true;
                if self.conn.is_connected().await {
                    self.conn.disconnect_for_idle("tab hidden").await;
                }
            }
        } else if !was_visible {
            self.set_state(if self.user_active {
                IdleState::Active
            } else {
                IdleState::Idle
            });
            if self.disconnected_for_idle {
                self.reconnect().await;
            }
            self.reset_idle_deadline();
        }
    }

    async fn on_idle_timeout(&mut self) {
        info!("user idle, suspending connection");
        self.idle_deadline = None;
        self.user_active = false;
        self.set_state(IdleState::Idle);

        self.disconnected_for_idle = true;
        if self.conn.is_connected().await {
            self.conn.disconnect_for_idle("idle timeout").await;
        }
    }

    fn on_server_activity(&mut self) {
        if self.visible {
            self.reset_idle_deadline();
        }
    }

    async fn reconnect(&mut self) {
        if !self.visible {
            return;
        }

        self.disconnected_for_idle = false;
        self.set_state(IdleState::Active);
        if !self.conn.is_connected().await {
            info!("activity resumed, reconnecting");
            let _ = self.conn.connect().await;
        }
    }

    fn reset_idle_deadline(&mut self) {
        self.idle_deadline = if self.visible {
            Some(Instant::now() + self.idle_timeout)
        } else {
            None
        };
    }

    fn set_state(&self, state: IdleState) {
        self.idle_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
