//! Per-conversation message drafts.
//!
//! Drafts are local-device state with an independent lifecycle: one JSON
//! document in the key-value store, entries keyed by conversation id,
//! swept after seven days of inactivity. They are never synced.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{Attachment, EngineError, ErrorCategory};
use beacon_platform::KeyValueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};

const STORAGE_KEY: &str = "channel_drafts";
const STORAGE_VERSION: u32 = 1;
const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1_000;

/// One saved draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Draft {
    pub conversation_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Millisecond timestamp of the last save, used for expiry.
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DraftDocument {
    version: u32,
    drafts: HashMap<String, Draft>,
}

/// Keyed draft store over the platform key-value trait.
pub struct DraftStore {
    store: Arc<dyn KeyValueStore>,
    expiry_ms: i64,
}

impl DraftStore {
    pub fn new(store: Arc<dyn KeyValueStore>, expiry_days: u32) -> Self {
        Self {
            store,
            expiry_ms: i64::from(expiry_days) * MILLIS_PER_DAY,
        }
    }

    /// Save a draft. Empty content with no attachments clears the entry
    /// instead.
    pub fn save(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), EngineError> {
        self.save_at(conversation_id, content, attachments, now_ms())
    }

    /// Load a conversation's draft, clearing and skipping it when expired.
    pub fn load(&self, conversation_id: &str) -> Result<Option<Draft>, EngineError> {
        let mut document = self.read_document()?;
        let Some(draft) = document.drafts.get(conversation_id) else {
            return Ok(None);
        };

        if now_ms() - draft.updated_at_ms > self.expiry_ms {
            document.drafts.remove(conversation_id);
            self.write_document(&document)?;
            return Ok(None);
        }

        Ok(Some(draft.clone()))
    }

    pub fn clear(&self, conversation_id: &str) -> Result<(), EngineError> {
        let mut document = self.read_document()?;
        if document.drafts.remove(conversation_id).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }

    pub fn has_draft(&self, conversation_id: &str) -> Result<bool, EngineError> {
        Ok(self.load(conversation_id)?.is_some())
    }

    /// Remove every draft past the expiry window. Returns how many were
    /// dropped. Intended to run once at startup.
    pub fn sweep_expired(&self) -> Result<usize, EngineError> {
        let mut document = self.read_document()?;
        let cutoff = now_ms() - self.expiry_ms;
        let before = document.drafts.len();
        document.drafts.retain(|_, draft| draft.updated_at_ms >= cutoff);
        let removed = before - document.drafts.len();
        if removed > 0 {
            self.write_document(&document)?;
        }
        Ok(removed)
    }

    /// Conversation ids that currently hold a draft.
    pub fn conversations_with_drafts(&self) -> Result<Vec<String>, EngineError> {
        let document = self.read_document()?;
        Ok(document.drafts.keys().cloned().collect())
    }

    fn save_at(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        let mut document = self.read_document()?;

        if content.trim().is_empty() && attachments.is_empty() {
            document.drafts.remove(conversation_id);
        } else {
            document.drafts.insert(
                conversation_id.to_owned(),
                Draft {
                    conversation_id: conversation_id.to_owned(),
                    content: content.to_owned(),
                    attachments,
                    updated_at_ms: now_ms,
                },
            );
        }

        self.write_document(&document)
    }

    fn read_document(&self) -> Result<DraftDocument, EngineError> {
        let raw = self.store.get(STORAGE_KEY).map_err(store_error)?;
        let Some(raw) = raw else {
            return Ok(DraftDocument {
                version: STORAGE_VERSION,
                drafts: HashMap::new(),
            });
        };

        serde_json::from_str(&raw).map_err(|err| {
            EngineError::new(
                ErrorCategory::Serialization,
                "draft_decode_error",
                err.to_string(),
            )
        })
    }

    fn write_document(&self, document: &DraftDocument) -> Result<(), EngineError> {
        let encoded = serde_json::to_string(document).map_err(|err| {
            EngineError::new(
                ErrorCategory::Serialization,
                "draft_encode_error",
                err.to_string(),
            )
        })?;
        self.store.set(STORAGE_KEY, &encoded).map_err(store_error)
    }
}

fn store_error(err: beacon_platform::StoreError) -> EngineError {
    EngineError::new(ErrorCategory::Storage, "draft_store_error", err.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
