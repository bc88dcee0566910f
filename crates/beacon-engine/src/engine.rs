//! The reconciliation core.
//!
//! One task owns all conversation state and merges three concurrent message
//! sources — paginated REST history, the live push stream, and optimistic
//! local sends — into a single ordered, duplicate-free timeline per open
//! conversation. Everything else talks to it through channels; nothing
//! mutates its state from outside.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{
    message_dedup_key, new_provisional_id, ChannelError, Conversation, ConversationKind,
    ConversationMember, CreateMessageRequest, Delivery, EngineChannels, EngineCommand,
    EngineError, EngineEvent, EventStream, HistorySync, Message, NotificationKind, Profile,
    RecentSends, Timeline, TypingUser,
};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::ConversationApi;
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::directory::DirectoryCache;
use crate::dispatch::ActionDispatcher;
use crate::notify::NotificationCenter;
use crate::stream::{
    MembershipEvent, MessageDeleted, MessageStream, NotificationEvent, StreamEvent, TypingEvent,
    UnreadEvent,
};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const INTERNAL_BUFFER: usize = 128;
const PUBLIC_LISTING_LIMIT: u32 = 50;
const PREVIEW_LIMIT: usize = 50;
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Frontend handle to a running sync engine.
#[derive(Clone)]
pub struct EngineHandle {
    channels: EngineChannels,
}

impl EngineHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<(), ChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Results of work the engine farmed out to spawned fetch tasks.
enum Internal {
    HistoryLoaded {
        conversation_id: String,
        epoch: u64,
        result: Result<Vec<Message>, EngineError>,
    },
    ListingsLoaded {
        result: Result<Vec<Conversation>, EngineError>,
    },
    ConversationFetched {
        result: Result<Conversation, EngineError>,
        seed: Option<Message>,
        mention: bool,
    },
    MembersFetched {
        conversation_id: String,
        result: Result<Vec<ConversationMember>, EngineError>,
    },
    RestSendFinished {
        conversation_id: String,
        provisional_id: String,
        result: Result<Message, EngineError>,
    },
}

struct TypingEntry {
    display_name: String,
    deadline: Instant,
}

/// Per-open-conversation state. Replaced wholesale on conversation switch,
/// which is also what cancels stale history fetches: results are tagged with
/// the epoch they were issued under.
struct OpenConversation {
    id: String,
    epoch: u64,
    history: HistorySync,
    timeline: Timeline,
    typing: HashMap<String, TypingEntry>,
    /// Attachment ids of in-flight optimistic sends, kept for retries.
    pending_attachments: HashMap<String, Vec<String>>,
    /// Unread count captured at open time; anchors the new-messages divider.
    unread_on_entry: u32,
}

impl OpenConversation {
    fn new(id: String, epoch: u64, unread_on_entry: u32) -> Self {
        Self {
            id,
            epoch,
            history: HistorySync::new(),
            timeline: Timeline::new(),
            typing: HashMap::new(),
            pending_attachments: HashMap::new(),
            unread_on_entry,
        }
    }
}

/// The engine task. Construct with [`SyncEngine::spawn`].
pub struct SyncEngine {
    channels: EngineChannels,
    internal_tx: mpsc::Sender<Internal>,
    dispatcher: ActionDispatcher,
    api: Arc<dyn ConversationApi>,
    notifications: Arc<NotificationCenter>,
    directory: Arc<DirectoryCache>,
    local_user_id: String,
    typing_expiry: Duration,
    conversations: Vec<Conversation>,
    open: Option<OpenConversation>,
    recent_sends: RecentSends,
    foreground: bool,
    epoch_counter: u64,
    member_fetches_in_flight: std::collections::HashSet<String>,
}

impl SyncEngine {
    /// Spawn the engine task and return the frontend handle.
    pub fn spawn(
        conn: Arc<ConnectionManager>,
        stream: &MessageStream,
        api: Arc<dyn ConversationApi>,
        notifications: Arc<NotificationCenter>,
        directory: Arc<DirectoryCache>,
        local_user_id: impl Into<String>,
        config: &EngineConfig,
    ) -> EngineHandle {
        let (channels, command_rx) = EngineChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);

        let engine = Self {
            channels: channels.clone(),
            internal_tx,
            dispatcher: ActionDispatcher::new(Arc::clone(&conn), Arc::clone(&api)),
            api,
            notifications,
            directory,
            local_user_id: local_user_id.into(),
            typing_expiry: config.typing_expiry(),
            conversations: Vec::new(),
            open: None,
            recent_sends: RecentSends::new(config.recent_send_ttl()),
            foreground: true,
            epoch_counter: 0,
            member_fetches_in_flight: std::collections::HashSet::new(),
        };

        let events = stream.subscribe_all();
        let connectivity = conn.connectivity_errors();
        tokio::spawn(engine.run(command_rx, events, connectivity, internal_rx));

        EngineHandle { channels }
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut events: broadcast::Receiver<StreamEvent>,
        mut connectivity: broadcast::Receiver<EngineError>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        let mut typing_tick = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        let mut events_open = true;
        let mut connectivity_open = true;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_stream_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                error = connectivity.recv(), if connectivity_open => match error {
                    Ok(error) => self.channels.emit(EngineEvent::FatalConnectivity { error }),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => connectivity_open = false,
                },
                internal = internal_rx.recv() => {
                    if let Some(internal) = internal {
                        self.handle_internal(internal).await;
                    }
                }
                _ = typing_tick.tick() => self.sweep_typing(),
            }
        }

        debug!("sync engine exiting");
    }

    // =====================
    // Commands
    // =====================

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::RefreshConversations => self.spawn_listings_fetch(),
            EngineCommand::OpenConversation { conversation_id } => {
                self.handle_open(conversation_id).await
            }
            EngineCommand::CloseConversation => self.handle_close().await,
            EngineCommand::SendMessage {
                content,
                parent_id,
                attachment_ids,
            } => self.handle_send(content, parent_id, attachment_ids).await,
            EngineCommand::EditMessage {
                message_id,
                content,
            } => {
                if !self.dispatcher.edit_message(&message_id, &content).await {
                    warn!(message_id, "edit not transmitted: socket unavailable");
                }
            }
            EngineCommand::DeleteMessage { message_id } => {
                if !self.dispatcher.delete_message(&message_id).await {
                    warn!(message_id, "delete not transmitted: socket unavailable");
                }
            }
            EngineCommand::DiscardFailedSend { provisional_id } => {
                let removed = self
                    .open
                    .as_mut()
                    .is_some_and(|open| {
                        open.pending_attachments.remove(&provisional_id);
                        open.timeline.remove(&provisional_id)
                    });
                if removed {
                    self.emit_timeline();
                }
            }
            EngineCommand::RetryFailedSend { provisional_id } => {
                self.handle_retry(provisional_id).await
            }
            EngineCommand::TypingStarted => {
                if let Some(id) = self.open_id() {
                    self.dispatcher.typing_start(&id).await;
                }
            }
            EngineCommand::TypingStopped => {
                if let Some(id) = self.open_id() {
                    self.dispatcher.typing_stop(&id).await;
                }
            }
            EngineCommand::MarkAllRead => self.handle_mark_all_read().await,
            EngineCommand::SetForeground { foreground } => {
                self.handle_set_foreground(foreground).await
            }
        }
    }

    async fn handle_open(&mut self, conversation_id: String) {
        if self.open.as_ref().is_some_and(|o| o.id == conversation_id) {
            return;
        }

        if let Some(previous) = self.open.take() {
            self.dispatcher.leave(&previous.id).await;
        }

        let unread_on_entry = self
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.unread_count)
            .unwrap_or(0);

        // Unread and mention clear together when the conversation opens.
        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.unread_count = 0;
            conversation.has_mention = false;
        }

        self.epoch_counter += 1;
        let epoch = self.epoch_counter;
        let mut open = OpenConversation::new(conversation_id.clone(), epoch, unread_on_entry);
        if let Err(err) = open.history.begin() {
            warn!(error = %err, "history begin rejected");
        }
        self.open = Some(open);

        self.dispatcher.join(&conversation_id).await;
        self.spawn_history_fetch(conversation_id, epoch);
        self.emit_conversations();
        self.emit_timeline();
        self.emit_typing();
    }

    async fn handle_close(&mut self) {
        if let Some(open) = self.open.take() {
            self.dispatcher.leave(&open.id).await;
        }
    }

    async fn handle_send(
        &mut self,
        content: String,
        parent_id: Option<String>,
        attachment_ids: Vec<String>,
    ) {
        let content = content.trim().to_owned();
        if content.is_empty() && attachment_ids.is_empty() {
            return;
        }

        let Some(open) = self.open.as_mut() else {
            warn!("send requested with no open conversation");
            return;
        };
        let conversation_id = open.id.clone();

        let provisional_id = new_provisional_id();
        let message = Message {
            id: provisional_id.clone(),
            temp_id: Some(provisional_id.clone()),
            conversation: Some(conversation_id.clone()),
            user_id: Some(self.local_user_id.clone()),
            username: None,
            display_name: None,
            content: content.clone(),
            parent: parent_id.clone(),
            reply_count: 0,
            created_at: Utc::now(),
            updated_at: None,
            edited_at: None,
            deleted_at: None,
            is_edited: false,
            is_deleted: false,
            attachments: Vec::new(),
            delivery: Delivery::Pending,
        };

        let dedup = message_dedup_key(&message);
        open.timeline.insert_pending(message);
        // The local user's own sends are not unread; keep the divider anchored.
        if open.unread_on_entry > 0 {
            open.unread_on_entry += 1;
        }
        open.pending_attachments
            .insert(provisional_id.clone(), attachment_ids.clone());
        self.recent_sends.insert(dedup);
        self.emit_timeline();

        // Live connection first: it persists and broadcasts in one round
        // trip. REST is the durable fallback.
        let transmitted = self
            .dispatcher
            .send_message(
                &conversation_id,
                &content,
                parent_id.as_deref(),
                Some(&provisional_id),
                &attachment_ids,
            )
            .await;

        if !transmitted {
            warn!("socket unavailable, sending via REST");
            self.spawn_rest_send(
                conversation_id,
                provisional_id,
                content,
                parent_id,
                attachment_ids,
            );
        }
    }

    async fn handle_retry(&mut self, provisional_id: String) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let Some(message) = open.timeline.get(&provisional_id).cloned() else {
            return;
        };
        if message.delivery != Delivery::Failed {
            return;
        }

        let conversation_id = open.id.clone();
        let attachment_ids = open
            .pending_attachments
            .get(&provisional_id)
            .cloned()
            .unwrap_or_default();
        open.timeline.mark_pending(&provisional_id);
        self.recent_sends.insert(message_dedup_key(&message));
        self.emit_timeline();

        let transmitted = self
            .dispatcher
            .send_message(
                &conversation_id,
                &message.content,
                message.parent.as_deref(),
                Some(&provisional_id),
                &attachment_ids,
            )
            .await;

        if !transmitted {
            self.spawn_rest_send(
                conversation_id,
                provisional_id,
                message.content,
                message.parent,
                attachment_ids,
            );
        }
    }

    async fn handle_mark_all_read(&mut self) {
        let targets: Vec<String> = self
            .conversations
            .iter()
            .filter(|c| c.unread_count > 0)
            .map(|c| c.id.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        // Clears unread only; mention flags persist until the conversation
        // itself is opened.
        for conversation in &mut self.conversations {
            conversation.unread_count = 0;
        }
        for conversation_id in &targets {
            self.dispatcher.mark_read(conversation_id, None).await;
        }
        self.emit_conversations();
    }

    async fn handle_set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
        if !foreground {
            return;
        }

        // Catching up: the open conversation was being read all along.
        let target = self.open.as_ref().and_then(|open| {
            open.timeline
                .items()
                .last()
                .map(|m| (open.id.clone(), m.id.clone()))
        });
        if let Some((conversation_id, last_id)) = target {
            if let Some(conversation) = self
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.unread_count = 0;
            }
            self.dispatcher
                .mark_read(&conversation_id, Some(&last_id))
                .await;
            self.emit_conversations();
        }
    }

    // =====================
    // Live stream events
    // =====================

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::NewMessage(message) => self.handle_new_message(message).await,
            StreamEvent::MessageEdited(message) => self.handle_edited(message),
            StreamEvent::MessageDeleted(event) => self.handle_deleted(event),
            StreamEvent::Typing(event) => self.handle_typing(event),
            StreamEvent::Presence(event) => self.channels.emit(EngineEvent::PresenceChanged {
                user_id: event.user_id,
                is_online: event.is_online,
                last_seen: event.last_seen,
            }),
            StreamEvent::Unread(event) => self.handle_unread(event),
            StreamEvent::DmNotification(event) => {
                self.handle_notification(NotificationKind::Dm, event).await
            }
            StreamEvent::ChannelNotification(event) => {
                self.handle_notification(NotificationKind::Channel, event)
                    .await
            }
            StreamEvent::MentionNotification(event) => {
                self.handle_notification(NotificationKind::Mention, event)
                    .await
            }
            StreamEvent::Membership(event) => self.handle_membership(event),
            StreamEvent::ServerError(event) => self.channels.emit(EngineEvent::ServerError {
                error: event.error,
                code: event.code,
            }),
        }
    }

    async fn handle_new_message(&mut self, message: Message) {
        let Some(conversation_id) = message.conversation.clone() else {
            return;
        };
        let is_own = message.user_id.as_deref() == Some(self.local_user_id.as_str());

        // Our own send echoed back: confirm the pending entry in place,
        // never append a second copy.
        if is_own && self.recent_sends.contains(&message_dedup_key(&message)) {
            let mut confirmed = false;
            if let Some(open) = self.open.as_mut() {
                if open.id == conversation_id {
                    confirmed = match message.temp_id.as_deref() {
                        Some(temp) => {
                            open.timeline.confirm(temp, message.clone())
                                || open.timeline.confirm_echo(message.clone())
                        }
                        None => open.timeline.confirm_echo(message.clone()),
                    };
                    if let Some(temp) = message.temp_id.as_deref() {
                        open.pending_attachments.remove(temp);
                    }
                }
            }
            self.touch_conversation(&message, true);
            if confirmed {
                self.emit_timeline();
            }
            self.emit_conversations();
            return;
        }

        let mut viewed = false;
        let mut last_id = None;
        if let Some(open) = self.open.as_mut() {
            if open.id == conversation_id {
                let accepted = if open.history.is_loading() {
                    open.history
                        .buffer_live(message.clone(), &mut self.recent_sends)
                } else {
                    open.timeline
                        .push_live(message.clone(), &mut self.recent_sends)
                };
                if accepted && open.unread_on_entry > 0 {
                    open.unread_on_entry += 1;
                }
                viewed = true;
                last_id = Some(message.id.clone());
            }
        }

        if viewed {
            if self.foreground {
                if let Some(last_id) = &last_id {
                    self.dispatcher.mark_read(&conversation_id, Some(last_id)).await;
                }
            }
            self.emit_timeline();
        }

        self.touch_conversation(&message, is_own);
        self.emit_conversations();
    }

    fn handle_edited(&mut self, message: Message) {
        let mut dirty = false;
        if let Some(open) = self.open.as_mut() {
            let matches_open = message
                .conversation
                .as_deref()
                .map_or(true, |id| id == open.id);
            if matches_open {
                dirty = open.timeline.apply_edit(message);
            }
        }
        if dirty {
            self.emit_timeline();
        }
    }

    fn handle_deleted(&mut self, event: MessageDeleted) {
        let mut dirty = false;
        if let Some(open) = self.open.as_mut() {
            if open.id == event.conversation_id {
                dirty = open.timeline.remove(&event.message_id);
            }
        }
        if dirty {
            self.emit_timeline();
        }
    }

    fn handle_typing(&mut self, event: TypingEvent) {
        if event.user_id == self.local_user_id {
            return;
        }
        let typing_expiry = self.typing_expiry;
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if open.id != event.conversation_id {
            return;
        }

        if event.is_typing {
            // Prefer the directory's name over whatever rode in on the wire.
            let display_name = self
                .directory
                .display_name(&event.user_id)
                .or_else(|| event.display_name.clone().filter(|name| !name.is_empty()))
                .unwrap_or_else(|| event.username.clone());
            open.typing.insert(
                event.user_id,
                TypingEntry {
                    display_name,
                    deadline: Instant::now() + typing_expiry,
                },
            );
        } else {
            open.typing.remove(&event.user_id);
        }
        self.emit_typing();
    }

    fn handle_unread(&mut self, event: UnreadEvent) {
        // Server-pushed counters are authoritative.
        let mut dirty = false;
        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == event.conversation_id)
        {
            conversation.unread_count = event.unread_count;
            dirty = true;
        }
        if dirty {
            self.emit_conversations();
        }
    }

    async fn handle_notification(&mut self, kind: NotificationKind, event: NotificationEvent) {
        // The backend should not notify senders about their own messages;
        // drop it if one slips through.
        if event.actor_id == self.local_user_id {
            debug!(?kind, "ignoring notification for own message");
            return;
        }

        match kind {
            NotificationKind::Dm | NotificationKind::Channel => {
                // A notification for the open conversation carries a message
                // the timeline may not have seen yet.
                let mut viewed = false;
                if let Some(open) = self.open.as_mut() {
                    if open.id == event.conversation_id {
                        if open.history.is_loading() {
                            open.history
                                .buffer_live(event.message.clone(), &mut self.recent_sends);
                        } else {
                            open.timeline
                                .push_live(event.message.clone(), &mut self.recent_sends);
                        }
                        viewed = true;
                    }
                }
                if viewed {
                    if self.foreground {
                        self.dispatcher
                            .mark_read(&event.conversation_id, Some(&event.message.id))
                            .await;
                    }
                    self.emit_timeline();
                }
                self.touch_conversation(&event.message, false);
                self.emit_conversations();
            }
            NotificationKind::Mention => {
                let is_open = self
                    .open
                    .as_ref()
                    .is_some_and(|o| o.id == event.conversation_id);
                if !is_open {
                    let index = self
                        .conversations
                        .iter()
                        .position(|c| c.id == event.conversation_id);
                    match index {
                        Some(index) => self.conversations[index].has_mention = true,
                        None => self.spawn_conversation_fetch(
                            event.conversation_id.clone(),
                            Some(event.message.clone()),
                            true,
                        ),
                    }
                    self.emit_conversations();
                }
            }
        }

        self.surface_notification(kind, &event);
    }

    fn handle_membership(&mut self, event: MembershipEvent) {
        let (conversation_id, delta) = match &event {
            MembershipEvent::Joined {
                conversation_id, ..
            } => (conversation_id.clone(), 1i64),
            MembershipEvent::Left {
                conversation_id, ..
            } => (conversation_id.clone(), -1i64),
        };

        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            if let Some(count) = conversation.member_count {
                conversation.member_count =
                    Some(i64::from(count).saturating_add(delta).max(0) as u32);
            }
        }

        self.channels
            .emit(EngineEvent::MembershipChanged { conversation_id });
        self.emit_conversations();
    }

    // =====================
    // Spawned fetch results
    // =====================

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::HistoryLoaded {
                conversation_id,
                epoch,
                result,
            } => self.handle_history_loaded(conversation_id, epoch, result).await,
            Internal::ListingsLoaded { result } => self.handle_listings_loaded(result),
            Internal::ConversationFetched {
                result,
                seed,
                mention,
            } => self.handle_conversation_fetched(result, seed, mention),
            Internal::MembersFetched {
                conversation_id,
                result,
            } => self.handle_members_fetched(conversation_id, result),
            Internal::RestSendFinished {
                conversation_id,
                provisional_id,
                result,
            } => self.handle_rest_send_finished(conversation_id, provisional_id, result),
        }
    }

    async fn handle_history_loaded(
        &mut self,
        conversation_id: String,
        epoch: u64,
        result: Result<Vec<Message>, EngineError>,
    ) {
        let mut mark_read_target = None;
        let mut failure = None;
        {
            let Some(open) = self.open.as_mut() else {
                debug!("dropping history result: no open conversation");
                return;
            };
            // A switch away and back re-issues the fetch under a new epoch;
            // late results for the old one are dropped here.
            if open.id != conversation_id || open.epoch != epoch {
                debug!("dropping stale history result");
                return;
            }

            match result {
                Ok(mut messages) => {
                    // The fetch endpoint returns newest first.
                    messages.reverse();
                    for message in &mut messages {
                        if message.conversation.is_none() {
                            message.conversation = Some(conversation_id.clone());
                        }
                    }
                    if let Err(err) =
                        open.history
                            .complete(&mut open.timeline, messages, &mut self.recent_sends)
                    {
                        warn!(error = %err, "history completion rejected");
                        return;
                    }
                    mark_read_target = open.timeline.items().last().map(|m| m.id.clone());
                }
                Err(error) => {
                    open.history.fail();
                    failure = Some(error);
                }
            }
        }

        if let Some(error) = failure {
            self.channels.emit(EngineEvent::HistoryFailed {
                conversation_id,
                error,
            });
            return;
        }

        self.emit_timeline();
        if self.foreground {
            if let Some(last_id) = mark_read_target {
                self.dispatcher
                    .mark_read(&conversation_id, Some(&last_id))
                    .await;
            }
        }
    }

    fn handle_listings_loaded(&mut self, result: Result<Vec<Conversation>, EngineError>) {
        let fresh = match result {
            Ok(fresh) => fresh,
            Err(error) => {
                self.channels.emit(EngineEvent::ListingFailed { error });
                return;
            }
        };

        for incoming in fresh {
            let index = self.conversations.iter().position(|c| c.id == incoming.id);
            match index {
                Some(index) => {
                    let existing = &mut self.conversations[index];
                    // Overlay server-side fields, keep local-only state
                    // (dm peer profile, pending clears).
                    existing.name = incoming.name;
                    existing.kind = incoming.kind;
                    existing.description = incoming.description;
                    existing.is_archived = incoming.is_archived;
                    existing.unread_count = incoming.unread_count;
                    existing.has_mention = incoming.has_mention;
                    existing.last_activity_at = incoming.last_activity_at;
                    existing.last_message_preview = incoming.last_message_preview;
                    existing.member_count = incoming.member_count;
                    existing.member_ids = incoming.member_ids;
                }
                None => self.conversations.push(incoming),
            }
        }

        // The open conversation is being read; a refresh must not resurrect
        // its cleared counters.
        if let Some(open_id) = self.open.as_ref().map(|o| o.id.clone()) {
            if let Some(conversation) =
                self.conversations.iter_mut().find(|c| c.id == open_id)
            {
                conversation.unread_count = 0;
                conversation.has_mention = false;
            }
        }

        self.populate_dm_peers();
        self.emit_conversations();
    }

    fn handle_conversation_fetched(
        &mut self,
        result: Result<Conversation, EngineError>,
        seed: Option<Message>,
        mention: bool,
    ) {
        let mut conversation = match result {
            Ok(conversation) => conversation,
            Err(error) => {
                warn!(error = %error, "conversation fetch failed");
                return;
            }
        };
        if self.conversations.iter().any(|c| c.id == conversation.id) {
            return;
        }

        conversation.unread_count = 1;
        conversation.has_mention = mention;
        if let Some(seed) = seed {
            conversation.last_activity_at = Some(seed.created_at);
            conversation.last_message_preview = Some(preview_text(&seed.content));
        }
        self.conversations.push(conversation);
        self.populate_dm_peers();
        self.emit_conversations();
    }

    fn handle_members_fetched(
        &mut self,
        conversation_id: String,
        result: Result<Vec<ConversationMember>, EngineError>,
    ) {
        self.member_fetches_in_flight.remove(&conversation_id);
        let members = match result {
            Ok(members) => members,
            Err(error) => {
                warn!(conversation_id, error = %error, "member fetch failed");
                return;
            }
        };

        let Some(peer) = members
            .iter()
            .find(|m| m.user_id != self.local_user_id)
        else {
            return;
        };

        // Directory profile when known, membership row as the fallback.
        let dm_peer = self.directory.get(&peer.user_id).unwrap_or_else(|| Profile {
            user_id: peer.user_id.clone(),
            username: peer.user_id.clone(),
            display_name: peer
                .display_name
                .clone()
                .unwrap_or_else(|| "Unknown User".to_owned()),
            avatar_url: None,
            is_online: false,
            last_seen: None,
        });

        let mut dirty = false;
        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.dm_peer = Some(dm_peer);
            dirty = true;
        }
        if dirty {
            self.emit_conversations();
        }
    }

    fn handle_rest_send_finished(
        &mut self,
        conversation_id: String,
        provisional_id: String,
        result: Result<Message, EngineError>,
    ) {
        let mut dirty = false;
        let mut failed = false;
        if let Some(open) = self.open.as_mut() {
            if open.id == conversation_id {
                match result {
                    Ok(mut confirmed) => {
                        if confirmed.conversation.is_none() {
                            confirmed.conversation = Some(conversation_id.clone());
                        }
                        dirty = open.timeline.confirm(&provisional_id, confirmed);
                        open.pending_attachments.remove(&provisional_id);
                    }
                    Err(error) => {
                        warn!(error = %error, "durable send failed");
                        // A later echo may have confirmed the send already;
                        // only still-pending messages surface as failed.
                        dirty = open.timeline.mark_failed(&provisional_id);
                        failed = dirty;
                    }
                }
            }
        }

        if failed {
            self.channels.emit(EngineEvent::SendFailed {
                conversation_id,
                provisional_id,
            });
        }
        if dirty {
            self.emit_timeline();
        }
    }

    // =====================
    // Shared state helpers
    // =====================

    /// Conversation-list bookkeeping for an inbound message: bump activity
    /// and preview, and count it unread unless it is the local user's own or
    /// the conversation is open in a foregrounded view.
    fn touch_conversation(&mut self, message: &Message, is_own: bool) {
        let Some(conversation_id) = message.conversation.clone() else {
            return;
        };
        let suppress_unread = is_own
            || (self.foreground
                && self
                    .open
                    .as_ref()
                    .is_some_and(|o| o.id == conversation_id));

        let index = self.conversations.iter().position(|c| c.id == conversation_id);
        match index {
            Some(index) => {
                let conversation = &mut self.conversations[index];
                conversation.last_activity_at = Some(message.created_at);
                conversation.last_message_preview = Some(preview_text(&message.content));
                if !suppress_unread {
                    conversation.unread_count = conversation.unread_count.saturating_add(1);
                }
            }
            None => {
                // Likely a DM created elsewhere; pull it into the list.
                if !is_own {
                    self.spawn_conversation_fetch(conversation_id, Some(message.clone()), false);
                }
            }
        }
    }

    fn surface_notification(&mut self, kind: NotificationKind, event: &NotificationEvent) {
        let conversation_name = self
            .conversations
            .iter()
            .find(|c| c.id == event.conversation_id)
            .map(|c| c.name.clone())
            .filter(|name| !name.is_empty());
        let sender_name = self
            .directory
            .display_name(&event.actor_id)
            .or_else(|| event.message.display_name.clone())
            .or_else(|| event.message.username.clone());
        let sender = sender_name.clone().unwrap_or_else(|| "Someone".to_owned());

        let (title, body) = match kind {
            NotificationKind::Dm => (
                sender_name.unwrap_or_else(|| "New Message".to_owned()),
                event.message.content.clone(),
            ),
            NotificationKind::Channel => (
                conversation_name
                    .map(|name| format!("#{name}"))
                    .unwrap_or_else(|| "New Message".to_owned()),
                format!("{sender}: {}", event.message.content),
            ),
            NotificationKind::Mention => (
                format!(
                    "Mentioned in {}",
                    conversation_name
                        .map(|name| format!("#{name}"))
                        .unwrap_or_else(|| "a channel".to_owned())
                ),
                event.message.content.clone(),
            ),
        };

        if self
            .notifications
            .show(kind, self.foreground, &title, &body)
        {
            self.channels.emit(EngineEvent::Notification {
                kind,
                conversation_id: event.conversation_id.clone(),
                title,
                body,
            });
        }
    }

    fn sweep_typing(&mut self) {
        let now = Instant::now();
        let mut changed = false;
        if let Some(open) = self.open.as_mut() {
            let before = open.typing.len();
            open.typing.retain(|_, entry| entry.deadline > now);
            changed = open.typing.len() != before;
        }
        if changed {
            self.emit_typing();
        }
    }

    fn open_id(&self) -> Option<String> {
        self.open.as_ref().map(|open| open.id.clone())
    }

    // =====================
    // Emission
    // =====================

    fn emit_conversations(&self) {
        self.channels.emit(EngineEvent::ConversationsUpdated {
            conversations: sorted_view(&self.conversations),
        });
    }

    fn emit_timeline(&self) {
        let Some(open) = self.open.as_ref() else {
            return;
        };
        let divider_index = open
            .timeline
            .divider_index(open.unread_on_entry, Some(self.local_user_id.as_str()));
        self.channels.emit(EngineEvent::TimelineUpdated {
            conversation_id: open.id.clone(),
            messages: open.timeline.items().to_vec(),
            divider_index,
        });
    }

    fn emit_typing(&self) {
        let Some(open) = self.open.as_ref() else {
            return;
        };
        let mut users: Vec<TypingUser> = open
            .typing
            .iter()
            .map(|(user_id, entry)| TypingUser {
                user_id: user_id.clone(),
                display_name: entry.display_name.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        self.channels.emit(EngineEvent::TypingChanged {
            conversation_id: open.id.clone(),
            users,
        });
    }

    // =====================
    // Spawned fetches
    // =====================

    fn spawn_history_fetch(&self, conversation_id: String, epoch: u64) {
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.messages(&conversation_id, None).await;
            let _ = tx
                .send(Internal::HistoryLoaded {
                    conversation_id,
                    epoch,
                    result,
                })
                .await;
        });
    }

    fn spawn_listings_fetch(&self) {
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let mine = api.my_conversations().await?;
                let public = api
                    .public_conversations(PUBLIC_LISTING_LIMIT, None)
                    .await?;
                let mut combined = mine;
                let known: std::collections::HashSet<String> =
                    combined.iter().map(|c| c.id.clone()).collect();
                combined.extend(
                    public
                        .results
                        .into_iter()
                        .filter(|c| !known.contains(&c.id)),
                );
                Ok(combined)
            }
            .await;
            let _ = tx.send(Internal::ListingsLoaded { result }).await;
        });
    }

    fn spawn_conversation_fetch(
        &self,
        conversation_id: String,
        seed: Option<Message>,
        mention: bool,
    ) {
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.conversation(&conversation_id).await;
            let _ = tx
                .send(Internal::ConversationFetched {
                    result,
                    seed,
                    mention,
                })
                .await;
        });
    }

    fn populate_dm_peers(&mut self) {
        let targets: Vec<String> = self
            .conversations
            .iter()
            .filter(|c| {
                c.kind == ConversationKind::Direct
                    && c.dm_peer.is_none()
                    && !self.member_fetches_in_flight.contains(&c.id)
            })
            .map(|c| c.id.clone())
            .collect();

        for conversation_id in targets {
            self.member_fetches_in_flight.insert(conversation_id.clone());
            let api = Arc::clone(&self.api);
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = api.members(&conversation_id).await;
                let _ = tx
                    .send(Internal::MembersFetched {
                        conversation_id,
                        result,
                    })
                    .await;
            });
        }
    }

    fn spawn_rest_send(
        &self,
        conversation_id: String,
        provisional_id: String,
        content: String,
        parent: Option<String>,
        attachment_ids: Vec<String>,
    ) {
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let request = CreateMessageRequest {
            conversation: conversation_id.clone(),
            content,
            parent,
            attachment_ids: if attachment_ids.is_empty() {
                None
            } else {
                Some(attachment_ids)
            },
        };
        tokio::spawn(async move {
            let result = api.create_message(&request).await;
            let _ = tx
                .send(Internal::RestSendFinished {
                    conversation_id,
                    provisional_id,
                    result,
                })
                .await;
        });
    }
}

/// Sorted, UI-facing view of the conversation list: archived conversations
/// filtered out, unread/mention tier first, most recent activity next, ties
/// keeping their existing relative order.
fn sorted_view(conversations: &[Conversation]) -> Vec<Conversation> {
    let mut view: Vec<Conversation> = conversations
        .iter()
        .filter(|c| !c.is_archived)
        .cloned()
        .collect();
    view.sort_by_key(|c| {
        let tier = if c.unread_count > 0 || c.has_mention {
            0u8
        } else {
            1u8
        };
        let activity = c
            .last_activity_at
            .map(|at| at.timestamp_millis())
            .unwrap_or(i64::MIN);
        (tier, std::cmp::Reverse(activity))
    });
    view
}

fn preview_text(content: &str) -> String {
    if content.chars().count() <= PREVIEW_LIMIT {
        return content.to_owned();
    }
    content.chars().take(PREVIEW_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conversation(id: &str, unread: u32, mention: bool, activity_secs: i64) -> Conversation {
        Conversation {
            id: id.into(),
            name: id.into(),
            kind: ConversationKind::Public,
            description: None,
            created_by_id: None,
            created_at: None,
            is_archived: false,
            unread_count: unread,
            has_mention: mention,
            last_activity_at: Some(
                chrono::Utc
                    .timestamp_opt(1_731_000_000 + activity_secs, 0)
                    .unwrap(),
            ),
            last_message_preview: None,
            member_count: None,
            dm_peer: None,
            member_ids: None,
        }
    }

    #[test]
    fn unread_and_mention_sort_ahead_of_recency() {
        let list = vec![
            conversation("quiet_recent", 0, false, 100),
            conversation("unread_old", 2, false, 10),
            conversation("mention_older", 0, true, 5),
            conversation("quiet_old", 0, false, 1),
        ];

        let ids: Vec<String> = sorted_view(&list).into_iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec!["unread_old", "mention_older", "quiet_recent", "quiet_old"]
        );
    }

    #[test]
    fn equal_activity_keeps_original_relative_order() {
        let list = vec![
            conversation("a", 0, false, 50),
            conversation("b", 0, false, 50),
            conversation("c", 0, false, 50),
        ];

        let ids: Vec<String> = sorted_view(&list).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn archived_conversations_are_filtered_not_removed() {
        let mut archived = conversation("archived", 5, true, 100);
        archived.is_archived = true;
        let list = vec![archived, conversation("live", 0, false, 10)];

        let ids: Vec<String> = sorted_view(&list).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["live"]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn preview_is_capped_at_fifty_characters() {
        let long = "x".repeat(80);
        assert_eq!(preview_text(&long).chars().count(), PREVIEW_LIMIT);
        assert_eq!(preview_text("short"), "short");
    }
}
