use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Reserved prefix marking a locally generated message id that is still
/// awaiting server confirmation.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Generate a fresh provisional message id.
pub fn new_provisional_id() -> String {
    format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4())
}

/// Whether an id carries the provisional prefix.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

/// Conversation kind. The wire historically used both `dm` and `direct` for
/// direct conversations; both deserialize to [`ConversationKind::Direct`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Public,
    Private,
    Group,
    #[serde(alias = "dm")]
    Direct,
}

/// A chat user profile as exposed to the messaging core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A channel, group, or direct-message conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "channel_type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    /// Messages not yet read by the local user.
    #[serde(default)]
    pub unread_count: u32,
    /// Set when the local user was @mentioned in unread messages.
    #[serde(default)]
    pub has_mention: bool,
    #[serde(rename = "last_message_at", default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub member_count: Option<u32>,
    /// For direct conversations, the other participant's profile. Populated
    /// locally from the members endpoint, never synced back.
    #[serde(rename = "dm_user", default)]
    pub dm_peer: Option<Profile>,
    #[serde(default)]
    pub member_ids: Option<Vec<String>>,
}

/// A file attachment on a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Local delivery state of a message. Kept off the wire: inbound messages
/// are confirmed by construction, and only optimistic sends move through
/// `Pending` and (on failure) `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Awaiting server confirmation; `Message::id` holds the provisional id.
    Pending,
    /// Durably stored server-side; `Message::id` holds the server id.
    #[default]
    Confirmed,
    /// Durable write failed and no echo arrived; kept for user retry/removal.
    Failed,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Server id, or a provisional id (see [`PROVISIONAL_ID_PREFIX`]) while
    /// the send is unconfirmed.
    pub id: String,
    /// Provisional id echoed back by the server for optimistic matching.
    #[serde(default)]
    pub temp_id: Option<String>,
    /// Owning conversation. Optional on the wire; events with an unresolved
    /// conversation are dropped during normalization.
    #[serde(rename = "channel", alias = "channel_id", default)]
    pub conversation: Option<String>,
    /// Author; `None` for system-originated messages.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub content: String,
    /// Parent message id for thread replies.
    #[serde(rename = "parent", alias = "parent_id", default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub reply_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl Message {
    /// Whether this message is still awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }
}

/// Channel membership row from the members endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMember {
    #[serde(rename = "channel", default)]
    pub conversation: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

/// One user currently typing in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub display_name: String,
}

/// Transport connection state. Single instance, mutated only by the
/// connection manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Local engagement classification driven by the activity monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    Active,
    Idle,
    Hidden,
}

/// Presence status written to the external presence store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Background,
    Offline,
}

impl PresenceStatus {
    /// Stable string form used by the external presence collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Background => "background",
            Self::Offline => "offline",
        }
    }
}

/// Cursor-paginated listing response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationPage {
    pub results: Vec<Conversation>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub count: u64,
}

/// Body of a durable REST message write (the fallback path when the live
/// connection is unavailable).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateMessageRequest {
    #[serde(rename = "channel")]
    pub conversation: String,
    pub content: String,
    #[serde(rename = "parent", skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,
}

// =====================
// Wire protocol
// =====================

/// Server→client frame. One JSON object per frame, tagged by `type`.
///
/// Unknown tags fail deserialization; the stream layer logs and drops them
/// without tearing down the connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished,
    ChannelJoined {
        channel_id: String,
    },
    ChannelLeft {
        channel_id: String,
    },
    NewMessage {
        message: Message,
        #[serde(default)]
        channel_id: Option<String>,
        #[serde(default)]
        parent_id: Option<String>,
    },
    MessageEdited {
        message: Message,
        #[serde(default)]
        channel_id: Option<String>,
    },
    MessageDeleted {
        message_id: String,
        channel_id: String,
    },
    TypingIndicator {
        user_id: String,
        username: String,
        #[serde(default)]
        display_name: Option<String>,
        channel_id: String,
        is_typing: bool,
    },
    PresenceUpdate {
        user_id: String,
        is_online: bool,
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
    },
    UnreadUpdate {
        channel_id: String,
        unread_count: u32,
    },
    ReadReceipt {
        #[serde(default)]
        channel_id: Option<String>,
    },
    DmNotification {
        #[serde(default)]
        channel_id: Option<String>,
        message: Message,
        sender_id: String,
    },
    ChannelNotification {
        #[serde(default)]
        channel_id: Option<String>,
        message: Message,
        sender_id: String,
    },
    MentionNotification {
        #[serde(default)]
        channel_id: Option<String>,
        message: Message,
        mentioner_id: String,
    },
    MemberJoined {
        channel_id: String,
        member: ConversationMember,
    },
    MemberLeft {
        channel_id: String,
        user_id: String,
    },
    Error {
        error: String,
        #[serde(default)]
        code: Option<String>,
    },
    Pong,
}

/// Client→server frame.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinChannel {
        channel_id: String,
    },
    LeaveChannel {
        channel_id: String,
    },
    SendMessage {
        channel_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment_ids: Option<Vec<String>>,
    },
    EditMessage {
        message_id: String,
        content: String,
    },
    DeleteMessage {
        message_id: String,
    },
    TypingStart {
        channel_id: String,
    },
    TypingStop {
        channel_id: String,
    },
    MarkRead {
        channel_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_read_message_id: Option<String>,
    },
    Ping,
}

// =====================
// Engine protocol
// =====================

/// Notification kinds surfaced to the desktop notification sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Dm,
    Channel,
    Mention,
}

/// Command channel input accepted by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Re-fetch conversation listings and overlay unread/mention state.
    RefreshConversations,
    /// Open a conversation: join it, load history, clear unread + mention.
    OpenConversation {
        conversation_id: String,
    },
    /// Close the open conversation and leave its live channel.
    CloseConversation,
    /// Optimistically send a message to the open conversation.
    SendMessage {
        content: String,
        parent_id: Option<String>,
        attachment_ids: Vec<String>,
    },
    /// Edit an existing message.
    EditMessage {
        message_id: String,
        content: String,
    },
    /// Delete an existing message.
    DeleteMessage {
        message_id: String,
    },
    /// Discard a failed optimistic send from the visible list.
    DiscardFailedSend {
        provisional_id: String,
    },
    /// Retry a failed optimistic send.
    RetryFailedSend {
        provisional_id: String,
    },
    /// Local user started typing in the open conversation.
    TypingStarted,
    /// Local user stopped typing in the open conversation.
    TypingStopped,
    /// Clear unread counters everywhere, preserving mention flags.
    MarkAllRead,
    /// Whether the conversation view is currently foregrounded.
    SetForeground {
        foreground: bool,
    },
}

/// Event channel output emitted by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Sorted conversation list replacement (unread/mention tier first, then
    /// most recent activity; archived conversations filtered out).
    ConversationsUpdated {
        conversations: Vec<Conversation>,
    },
    /// Visible timeline replacement for the open conversation.
    TimelineUpdated {
        conversation_id: String,
        messages: Vec<Message>,
        /// Index the new-messages divider renders before, when applicable.
        divider_index: Option<usize>,
    },
    /// Users currently typing in the open conversation.
    TypingChanged {
        conversation_id: String,
        users: Vec<TypingUser>,
    },
    /// A user's live presence changed.
    PresenceChanged {
        user_id: String,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    },
    /// Membership of a conversation changed.
    MembershipChanged {
        conversation_id: String,
    },
    /// An optimistic send failed durably; the message stays visible with
    /// [`Delivery::Failed`].
    SendFailed {
        conversation_id: String,
        provisional_id: String,
    },
    /// History fetch failed; prior state is preserved.
    HistoryFailed {
        conversation_id: String,
        error: EngineError,
    },
    /// Conversation listing refresh failed; the current list is preserved.
    ListingFailed {
        error: EngineError,
    },
    /// Desktop notification request (already gated on preferences and
    /// foreground state).
    Notification {
        kind: NotificationKind,
        conversation_id: String,
        title: String,
        body: String,
    },
    /// Server-reported error frame.
    ServerError {
        error: String,
        code: Option<String>,
    },
    /// Reconnection attempts are exhausted; the connection stays down until
    /// an explicit reconnect.
    FatalConnectivity {
        error: EngineError,
    },
}
