//! Presence tracking: one writer for the local user's status, one reader
//! aggregating everyone else's.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use beacon_core::{ConnectionState, EngineError, IdleState, PresenceStatus};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// External presence collection the local user's status is persisted to.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn write_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<(), EngineError>;
}

/// Map connection and idle state to the persisted presence status.
///
/// `Offline` is never derived here; it is written once on teardown.
pub fn status_for(_connection: ConnectionState, idle: IdleState) -> PresenceStatus {
    match idle {
        IdleState::Active => PresenceStatus::Active,
        IdleState::Idle | IdleState::Hidden => PresenceStatus::Background,
    }
}

/// Writer half: persists the local user's status, only on change.
pub struct PresenceWriter {
    store: Arc<dyn PresenceStore>,
    user_id: String,
    current: Mutex<Option<PresenceStatus>>,
}

impl PresenceWriter {
    pub fn new(store: Arc<dyn PresenceStore>, user_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            user_id: user_id.into(),
            current: Mutex::new(None),
        })
    }

    /// Recompute and persist the status for the observed state pair.
    pub async fn observe(&self, connection: ConnectionState, idle: IdleState) {
        self.write_if_changed(status_for(connection, idle)).await;
    }

    /// Write `offline` on process/window teardown.
    pub async fn shutdown(&self) {
        self.write_if_changed(PresenceStatus::Offline).await;
    }

    /// Watch both state channels and persist on every change. Returns a
    /// token that stops the task.
    pub fn spawn(
        self: &Arc<Self>,
        mut connection_rx: watch::Receiver<ConnectionState>,
        mut idle_rx: watch::Receiver<IdleState>,
    ) -> CancellationToken {
        let writer = Arc::clone(self);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let connection = *connection_rx.borrow();
            let idle = *idle_rx.borrow();
            writer.observe(connection, idle).await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    changed = connection_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connection = *connection_rx.borrow();
                        let idle = *idle_rx.borrow();
                        writer.observe(connection, idle).await;
                    }
                    changed = idle_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connection = *connection_rx.borrow();
                        let idle = *idle_rx.borrow();
                        writer.observe(connection, idle).await;
                    }
                }
            }
        });

        cancel
    }

    async fn write_if_changed(&self, status: PresenceStatus) {
        let mut current = self.current.lock().await;
        if *current == Some(status) {
            return;
        }
        *current = Some(status);
        drop(current);

        debug!(user_id = %self.user_id, status = status.as_str(), "writing presence");
        if let Err(err) = self.store.write_status(&self.user_id, status).await {
            warn!(error = %err, "presence write failed");
        }
    }
}

/// Reader half: id → online mapping over the external presence collection,
/// recomputed on every change notification.
#[derive(Default)]
pub struct PresenceReader {
    online: RwLock<HashMap<String, bool>>,
}

impl PresenceReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping from a full collection snapshot. A user counts as
    /// online while active or backgrounded; only `offline` clears the dot.
    pub fn apply_snapshot(&self, entries: &[(String, PresenceStatus)]) {
        let Ok(mut online) = self.online.write() else {
            warn!("presence map lock poisoned");
            return;
        };
        online.clear();
        for (user_id, status) in entries {
            online.insert(
                user_id.clone(),
                matches!(status, PresenceStatus::Active | PresenceStatus::Background),
            );
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online
            .read()
            .map(|online| online.get(user_id).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.online
            .read()
            .map(|online| online.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingStore {
        writes: StdMutex<Vec<(String, PresenceStatus)>>,
    }

    #[async_trait]
    impl PresenceStore for RecordingStore {
        async fn write_status(
            &self,
            user_id: &str,
            status: PresenceStatus,
        ) -> Result<(), EngineError> {
            self.writes
                .lock()
                .expect("lock")
                .push((user_id.to_owned(), status));
            Ok(())
        }
    }

    #[test]
    fn maps_idle_states_to_statuses() {
        assert_eq!(
            status_for(ConnectionState::Connected, IdleState::Active),
            PresenceStatus::Active
        );
        assert_eq!(
            status_for(ConnectionState::Disconnected, IdleState::Idle),
            PresenceStatus::Background
        );
        assert_eq!(
            status_for(ConnectionState::Connected, IdleState::Hidden),
            PresenceStatus::Background
        );
    }

    #[tokio::test]
    async fn writer_skips_redundant_writes() {
        let store = Arc::new(RecordingStore::default());
        let writer = PresenceWriter::new(store.clone(), "u_me");

        writer
            .observe(ConnectionState::Connected, IdleState::Active)
            .await;
        writer
            .observe(ConnectionState::Connected, IdleState::Active)
            .await;
        writer
            .observe(ConnectionState::Connected, IdleState::Hidden)
            .await;
        writer.shutdown().await;

        let writes = store.writes.lock().expect("lock");
        assert_eq!(
            writes.as_slice(),
            &[
                ("u_me".to_owned(), PresenceStatus::Active),
                ("u_me".to_owned(), PresenceStatus::Background),
                ("u_me".to_owned(), PresenceStatus::Offline),
            ]
        );
    }

    #[test]
    fn reader_counts_background_users_as_online() {
        let reader = PresenceReader::new();
        reader.apply_snapshot(&[
            ("u_1".to_owned(), PresenceStatus::Active),
            ("u_2".to_owned(), PresenceStatus::Background),
            ("u_3".to_owned(), PresenceStatus::Offline),
        ]);

        assert!(reader.is_online("u_1"));
        assert!(reader.is_online("u_2"));
        assert!(!reader.is_online("u_3"));
        assert!(!reader.is_online("u_unknown"));
    }

    #[test]
    fn reader_recomputes_on_each_snapshot() {
        let reader = PresenceReader::new();
        reader.apply_snapshot(&[("u_1".to_owned(), PresenceStatus::Active)]);
        reader.apply_snapshot(&[("u_2".to_owned(), PresenceStatus::Active)]);

        assert!(!reader.is_online("u_1"));
        assert!(reader.is_online("u_2"));
    }
}
