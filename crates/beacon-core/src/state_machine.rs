//! Per-conversation history load lifecycle.
//!
//! While a history fetch is in flight, live messages for the conversation
//! are parked in a side buffer instead of the visible list, so the list
//! never misses a message that raced the fetch. Completion merges the
//! buffer into the loaded history; failure returns to `Idle` with the
//! buffer intact so nothing received is discarded.

use crate::error::{EngineError, ErrorCategory};
use crate::timeline::{RecentSends, Timeline};
use crate::types::Message;

/// Load phase of one conversation's message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryPhase {
    #[default]
    Idle,
    Loading,
    Loaded,
}

/// History load state machine with the Loading-phase side buffer.
#[derive(Debug, Default)]
pub struct HistorySync {
    phase: HistoryPhase,
    buffer: Vec<Message>,
}

impl HistorySync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> HistoryPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == HistoryPhase::Loading
    }

    pub fn buffered(&self) -> &[Message] {
        &self.buffer
    }

    /// Start a history fetch. Valid from `Idle` and `Loaded`; a fetch that
    /// is already in flight must finish or fail first.
    pub fn begin(&mut self) -> Result<(), EngineError> {
        if self.phase == HistoryPhase::Loading {
            return Err(EngineError::new(
                ErrorCategory::Internal,
                "history_load_in_progress",
                "a history fetch for this conversation is already running",
            ));
        }
        self.phase = HistoryPhase::Loading;
        Ok(())
    }

    /// Park a live message while the fetch is in flight. Returns whether the
    /// message was accepted (loading, and not already buffered).
    pub fn buffer_live(&mut self, message: Message, recent: &mut RecentSends) -> bool {
        if self.phase != HistoryPhase::Loading {
            return false;
        }

        let duplicate = self.buffer.iter().any(|m| m.id == message.id)
            || recent.contains(&crate::timeline::message_dedup_key(&message));
        if duplicate {
            return false;
        }

        self.buffer.push(message);
        true
    }

    /// Apply a completed fetch: merge buffered messages into the loaded
    /// history (oldest-first), clear the buffer, transition to `Loaded`.
    pub fn complete(
        &mut self,
        timeline: &mut Timeline,
        history: Vec<Message>,
        recent: &mut RecentSends,
    ) -> Result<(), EngineError> {
        if self.phase != HistoryPhase::Loading {
            return Err(EngineError::new(
                ErrorCategory::Internal,
                "history_not_loading",
                "history completion without a fetch in flight",
            ));
        }

        let buffered = std::mem::take(&mut self.buffer);
        timeline.merge_history(history, buffered, recent);
        self.phase = HistoryPhase::Loaded;
        Ok(())
    }

    /// Record a failed fetch. Buffered live messages are kept so a retry can
    /// still merge them.
    pub fn fail(&mut self) {
        if self.phase == HistoryPhase::Loading {
            self.phase = HistoryPhase::Idle;
        }
    }

    /// Drop all state, including the buffer. Used on conversation switch.
    pub fn reset(&mut self) {
        self.phase = HistoryPhase::Idle;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::types::Delivery;

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            temp_id: None,
            conversation: Some("c_1".into()),
            user_id: Some("u_1".into()),
            username: None,
            display_name: None,
            content: format!("body {id}"),
            parent: None,
            reply_count: 0,
            created_at: Utc.timestamp_opt(1_731_000_000 + secs, 0).unwrap(),
            updated_at: None,
            edited_at: None,
            deleted_at: None,
            is_edited: false,
            is_deleted: false,
            attachments: Vec::new(),
            delivery: Delivery::Confirmed,
        }
    }

    #[test]
    fn runs_idle_loading_loaded_cycle() {
        let mut sync = HistorySync::new();
        let mut timeline = Timeline::new();
        let mut recent = RecentSends::default();

        assert_eq!(sync.phase(), HistoryPhase::Idle);
        sync.begin().expect("begin from idle should work");
        assert!(sync.is_loading());

        sync.complete(&mut timeline, vec![message("A", 0)], &mut recent)
            .expect("complete should work");
        assert_eq!(sync.phase(), HistoryPhase::Loaded);
        assert_eq!(timeline.len(), 1);

        sync.begin().expect("reload from loaded should work");
    }

    #[test]
    fn rejects_overlapping_fetches() {
        let mut sync = HistorySync::new();
        sync.begin().expect("first begin should work");
        let err = sync.begin().expect_err("second begin must fail");
        assert_eq!(err.code, "history_load_in_progress");
    }

    #[test]
    fn buffers_live_messages_only_while_loading() {
        let mut sync = HistorySync::new();
        let mut recent = RecentSends::default();

        assert!(!sync.buffer_live(message("D", 30), &mut recent));

        sync.begin().expect("begin should work");
        assert!(sync.buffer_live(message("D", 30), &mut recent));
        // Same message delivered twice during the fetch.
        assert!(!sync.buffer_live(message("D", 30), &mut recent));
        assert_eq!(sync.buffered().len(), 1);
    }

    #[test]
    fn completion_merges_buffer_into_history() {
        let mut sync = HistorySync::new();
        let mut timeline = Timeline::new();
        let mut recent = RecentSends::default();

        sync.begin().expect("begin should work");
        sync.buffer_live(message("D", 30), &mut recent);
        sync.buffer_live(message("E", 40), &mut recent);

        sync.complete(
            &mut timeline,
            vec![message("A", 0), message("B", 10), message("C", 20)],
            &mut recent,
        )
        .expect("complete should work");

        let ids: Vec<&str> = timeline.items().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D", "E"]);
        assert!(sync.buffered().is_empty());
    }

    #[test]
    fn failure_keeps_buffered_messages_for_retry() {
        let mut sync = HistorySync::new();
        let mut timeline = Timeline::new();
        let mut recent = RecentSends::default();

        sync.begin().expect("begin should work");
        sync.buffer_live(message("D", 30), &mut recent);
        sync.fail();

        assert_eq!(sync.phase(), HistoryPhase::Idle);
        assert_eq!(sync.buffered().len(), 1);

        sync.begin().expect("retry should work");
        sync.complete(&mut timeline, Vec::new(), &mut recent)
            .expect("complete should work");
        let ids: Vec<&str> = timeline.items().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["D"]);
    }

    #[test]
    fn reset_discards_buffer_on_conversation_switch() {
        let mut sync = HistorySync::new();
        let mut recent = RecentSends::default();

        sync.begin().expect("begin should work");
        sync.buffer_live(message("D", 30), &mut recent);
        sync.reset();

        assert_eq!(sync.phase(), HistoryPhase::Idle);
        assert!(sync.buffered().is_empty());
    }
}
