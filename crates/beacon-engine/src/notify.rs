//! Desktop notification gating and persisted preferences.
//!
//! The actual notification chrome lives in the host; the engine only decides
//! whether a given dm/channel/mention event should surface, honoring the
//! session-wide enabled flag, per-kind preferences, and foreground state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use beacon_core::NotificationKind;
use beacon_platform::KeyValueStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ENABLED_KEY: &str = "notifications.enabled";
const PREFERENCES_KEY: &str = "notifications.preferences";
const BODY_PREVIEW_LIMIT: usize = 100;

/// Host-provided notification chrome.
pub trait NotificationSink: Send + Sync {
    fn show(&self, title: &str, body: &str);
}

/// Per-kind notification toggles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPreferences {
    pub dm: bool,
    pub channel: bool,
    pub mention: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            dm: true,
            channel: true,
            mention: true,
        }
    }
}

impl NotificationPreferences {
    fn allows(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Dm => self.dm,
            NotificationKind::Channel => self.channel,
            NotificationKind::Mention => self.mention,
        }
    }
}

/// Notification policy plus the optional sink to deliver through.
pub struct NotificationCenter {
    store: Arc<dyn KeyValueStore>,
    sink: Option<Arc<dyn NotificationSink>>,
    enabled: AtomicBool,
    preferences: Mutex<NotificationPreferences>,
}

impl NotificationCenter {
    pub fn new(store: Arc<dyn KeyValueStore>, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        let enabled = matches!(store.get(ENABLED_KEY), Ok(Some(value)) if value == "true");
        let preferences = store
            .get(PREFERENCES_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Self {
            store,
            sink,
            enabled: AtomicBool::new(enabled),
            preferences: Mutex::new(preferences),
        }
    }

    /// Whether notification delivery is enabled for this session. Also read
    /// by the activity monitor: a hidden tab only keeps its connection warm
    /// when notifications can actually be delivered.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if let Err(err) = self
            .store
            .set(ENABLED_KEY, if enabled { "true" } else { "false" })
        {
            warn!(error = %err, "failed persisting notification enabled flag");
        }
    }

    pub fn preferences(&self) -> NotificationPreferences {
        self.preferences
            .lock()
            .map(|preferences| *preferences)
            .unwrap_or_default()
    }

    pub fn set_preference(&self, kind: NotificationKind, value: bool) {
        let updated = {
            let Ok(mut preferences) = self.preferences.lock() else {
                warn!("notification preferences lock poisoned");
                return;
            };
            match kind {
                NotificationKind::Dm => preferences.dm = value,
                NotificationKind::Channel => preferences.channel = value,
                NotificationKind::Mention => preferences.mention = value,
            }
            *preferences
        };

        match serde_json::to_string(&updated) {
            Ok(encoded) => {
                if let Err(err) = self.store.set(PREFERENCES_KEY, &encoded) {
                    warn!(error = %err, "failed persisting notification preferences");
                }
            }
            Err(err) => warn!(error = %err, "failed encoding notification preferences"),
        }
    }

    /// Deliver a notification when policy allows. Foregrounded sessions are
    /// suppressed: the user is already looking at the conversation view.
    /// Returns whether the notification surfaced.
    pub fn show(
        &self,
        kind: NotificationKind,
        foreground: bool,
        title: &str,
        body: &str,
    ) -> bool {
        if !self.is_enabled() {
            debug!(?kind, "notification suppressed: disabled");
            return false;
        }
        if !self.preferences().allows(kind) {
            debug!(?kind, "notification suppressed: kind disabled");
            return false;
        }
        if foreground {
            debug!(?kind, "notification suppressed: view is foregrounded");
            return false;
        }

        if let Some(sink) = &self.sink {
            sink.show(title, &preview(body));
        }
        true
    }
}

fn preview(body: &str) -> String {
    if body.chars().count() <= BODY_PREVIEW_LIMIT {
        return body.to_owned();
    }
    let truncated: String = body.chars().take(BODY_PREVIEW_LIMIT).collect();
    format!("{truncated}...")
}
