//! Core contract of the Beacon real-time messaging engine.
//!
//! This crate defines the wire and domain protocol, the command/event
//! channel primitives, the retry and timeline reconciliation helpers, and
//! the stable error taxonomy shared between the runtime and frontend
//! consumers.

/// Async command/event channel primitives.
pub mod channel;
/// Stable engine error types and HTTP classification helpers.
pub mod error;
/// Inbound frame decoding and field normalization.
pub mod normalization;
/// Backoff policy used by the reconnect loop.
pub mod retry;
/// Per-conversation history load state machine.
pub mod state_machine;
/// Timeline merge/dedup buffer and the recent-sends cache.
pub mod timeline;
/// Wire protocol, domain model, and engine command/event types.
pub mod types;

pub use channel::{ChannelError, EngineChannels, EventStream};
pub use error::{classify_http_status, EngineError, ErrorCategory};
pub use normalization::{decode_frame, normalize_message, resolve_field};
pub use retry::RetryPolicy;
pub use state_machine::{HistoryPhase, HistorySync};
pub use timeline::{dedup_key, message_dedup_key, RecentSends, Timeline};
pub use types::{
    is_provisional_id, new_provisional_id, Attachment, ClientFrame, ConnectionState,
    Conversation, ConversationKind, ConversationMember, ConversationPage, CreateMessageRequest,
    Delivery, EngineCommand, EngineEvent, IdleState, Message, NotificationKind, PresenceStatus,
    Profile, ServerFrame, TypingUser, PROVISIONAL_ID_PREFIX,
};
