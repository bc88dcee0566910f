//! Ordered, duplicate-free visible message list plus the recent-sends cache
//! that absorbs races between a durable write completing and its broadcast
//! echo arriving.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::types::{Delivery, Message};

/// Dedup key for recognizing the same logical send across sources:
/// `(conversation, author, body, 5-second time bucket)`.
pub fn dedup_key(
    conversation: &str,
    author: Option<&str>,
    content: &str,
    created_at: DateTime<Utc>,
) -> String {
    let bucket = created_at.timestamp_millis().div_euclid(5_000);
    format!("{conversation}_{}_{content}_{bucket}", author.unwrap_or(""))
}

/// Dedup key of a message, using its own conversation/author/body/timestamp.
pub fn message_dedup_key(message: &Message) -> String {
    dedup_key(
        message.conversation.as_deref().unwrap_or(""),
        message.user_id.as_deref(),
        &message.content,
        message.created_at,
    )
}

/// Short-lived cache of dedup keys registered at optimistic-send time.
///
/// Entries expire after the configured TTL (10 seconds in production), long
/// enough to absorb the race between a durable REST/WS write completing and
/// its broadcast echo arriving.
#[derive(Debug)]
pub struct RecentSends {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl RecentSends {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: String) {
        self.insert_at(key, Instant::now());
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.contains_at(key, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn insert_at(&mut self, key: String, now: Instant) {
        self.purge(now);
        self.entries.insert(key, now);
    }

    fn contains_at(&mut self, key: &str, now: Instant) -> bool {
        self.purge(now);
        self.entries.contains_key(key)
    }

    fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, inserted| now.duration_since(*inserted) < ttl);
    }
}

impl Default for RecentSends {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// In-memory visible message list for one open conversation.
///
/// Invariants: items are sorted non-decreasing by `created_at`, and no two
/// items describe the same logical message (by server id, provisional id, or
/// dedup key).
#[derive(Debug, Default)]
pub struct Timeline {
    items: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current items in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Whether a candidate describes a message already present.
    ///
    /// Matches by id/provisional-id in either direction, then by dedup key
    /// against the recent-sends cache.
    pub fn is_duplicate(&self, candidate: &Message, recent: &mut RecentSends) -> bool {
        is_duplicate_in(&self.items, candidate, recent)
    }

    /// Append a live message, keeping the list ordered. Returns `false` when
    /// the candidate was recognized as a duplicate and dropped.
    pub fn push_live(&mut self, message: Message, recent: &mut RecentSends) -> bool {
        if self.is_duplicate(&message, recent) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Append an optimistic pending message.
    pub fn insert_pending(&mut self, mut message: Message) {
        message.delivery = Delivery::Pending;
        self.insert_sorted(message);
    }

    /// Replace a pending message in place with its confirmed counterpart,
    /// preserving its position. Keyed by provisional id.
    pub fn confirm(&mut self, provisional_id: &str, mut confirmed: Message) -> bool {
        confirmed.delivery = Delivery::Confirmed;
        let Some(index) = self.items.iter().position(|m| {
            m.id == provisional_id || m.temp_id.as_deref() == Some(provisional_id)
        }) else {
            return false;
        };
        self.items[index] = confirmed;
        true
    }

    /// Replace the first pending message with matching author and body by its
    /// live echo. Used when the echo carries no provisional id.
    pub fn confirm_echo(&mut self, mut echo: Message) -> bool {
        echo.delivery = Delivery::Confirmed;
        let Some(index) = self.items.iter().position(|m| {
            m.is_pending() && m.user_id == echo.user_id && m.content == echo.content
        }) else {
            return false;
        };
        self.items[index] = echo;
        true
    }

    /// Return a failed message to the pending state for a retry attempt.
    pub fn mark_pending(&mut self, provisional_id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|m| {
            m.id == provisional_id || m.temp_id.as_deref() == Some(provisional_id)
        }) else {
            return false;
        };
        item.delivery = Delivery::Pending;
        true
    }

    /// Mark a pending message as durably failed. It stays visible for
    /// user-initiated retry or removal. A message already confirmed by a
    /// later echo is left alone.
    pub fn mark_failed(&mut self, provisional_id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|m| {
            m.is_pending()
                && (m.id == provisional_id || m.temp_id.as_deref() == Some(provisional_id))
        }) else {
            return false;
        };
        item.delivery = Delivery::Failed;
        true
    }

    /// Look up a message by id or provisional id.
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.items
            .iter()
            .find(|m| m.id == id || m.temp_id.as_deref() == Some(id))
    }

    /// Apply a server-side edit, keyed by server id.
    pub fn apply_edit(&mut self, updated: Message) -> bool {
        let Some(item) = self.items.iter_mut().find(|m| m.id == updated.id) else {
            return false;
        };
        *item = updated;
        item.delivery = Delivery::Confirmed;
        true
    }

    /// Remove a message by id or provisional id.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(index) = self
            .items
            .iter()
            .position(|m| m.id == id || m.temp_id.as_deref() == Some(id))
        else {
            return false;
        };
        self.items.remove(index);
        true
    }

    /// Replace the list with fetched history merged with live messages
    /// buffered during the fetch, deduplicated and sorted ascending by
    /// creation time. Pending and failed local sends already visible are
    /// carried over so an in-flight optimistic send survives a history load.
    ///
    /// `history` is expected oldest-first.
    pub fn merge_history(
        &mut self,
        history: Vec<Message>,
        buffered: Vec<Message>,
        recent: &mut RecentSends,
    ) {
        let carried: Vec<Message> = self
            .items
            .drain(..)
            .filter(|m| m.delivery != Delivery::Confirmed)
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<Message> = Vec::with_capacity(history.len() + buffered.len());
        for message in history {
            if seen.insert(message.id.clone()) {
                merged.push(message);
            }
        }

        for message in buffered.into_iter().chain(carried) {
            if seen.contains(&message.id) || is_duplicate_in(&merged, &message, recent) {
                continue;
            }
            seen.insert(message.id.clone());
            merged.push(message);
        }

        merged.sort_by_key(|m| m.created_at);
        self.items = merged;
    }

    /// Index the new-messages divider renders before: the Nth most-recent
    /// message counting backward, skipping the local user's own messages.
    ///
    /// Returns `None` when the backward count exhausts the loaded window
    /// (the backend counted messages outside it) — flagged as ambiguous in
    /// the product, kept as observed.
    pub fn divider_index(
        &self,
        unread_on_entry: u32,
        local_user_id: Option<&str>,
    ) -> Option<usize> {
        if unread_on_entry == 0 {
            return None;
        }

        let mut counted = 0u32;
        for (index, message) in self.items.iter().enumerate().rev() {
            if local_user_id.is_some() && message.user_id.as_deref() == local_user_id {
                continue;
            }
            counted += 1;
            if counted == unread_on_entry {
                return Some(index);
            }
        }
        None
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .items
            .iter()
            .rposition(|m| m.created_at <= message.created_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.items.insert(index, message);
    }
}

fn is_duplicate_in(items: &[Message], candidate: &Message, recent: &mut RecentSends) -> bool {
    let id_match = items.iter().any(|m| {
        m.id == candidate.id
            || candidate
                .temp_id
                .as_deref()
                .is_some_and(|temp| m.id == temp || m.temp_id.as_deref() == Some(temp))
            || m.temp_id.as_deref() == Some(candidate.id.as_str())
    });
    if id_match {
        return true;
    }

    recent.contains(&message_dedup_key(candidate))
}
