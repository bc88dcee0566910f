use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Socket open/close/heartbeat failure.
    Transport,
    /// Malformed or unrecognized inbound frame.
    Decode,
    /// Optimistic message failed its durable write.
    Send,
    /// History or listing fetch failure.
    Fetch,
    /// Rate-limited by the chat server.
    RateLimited,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Standard transport-layer error.
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, code, message)
    }

    /// Standard decode-layer error for dropped frames.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Decode, "frame_decode_error", message)
    }
}

/// Map HTTP status codes to engine error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Fetch,
        _ => ErrorCategory::Internal,
    }
}
