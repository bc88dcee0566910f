//! Demultiplexes decoded frames into typed event channels.
//!
//! One broadcast channel per event kind for UI subscribers, plus a combined
//! [`StreamEvent`] channel the sync engine consumes so its loop has a single
//! receive point. Pong frames never reach this layer (the heartbeat consumes
//! them); events whose conversation id cannot be resolved are logged and
//! dropped here.

use beacon_core::normalization::{normalize_message, resolve_field};
use beacon_core::{ConversationMember, Message, ServerFrame};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeleted {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub conversation_id: String,
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadEvent {
    pub conversation_id: String,
    pub unread_count: u32,
}

/// DM/channel/mention notification with its conversation id resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub conversation_id: String,
    pub message: Message,
    /// Sender for dm/channel notifications, mentioner for mentions.
    pub actor_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined {
        conversation_id: String,
        member: ConversationMember,
    },
    Left {
        conversation_id: String,
        user_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorEvent {
    pub error: String,
    pub code: Option<String>,
}

/// Combined event stream consumed by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    NewMessage(Message),
    MessageEdited(Message),
    MessageDeleted(MessageDeleted),
    Typing(TypingEvent),
    Presence(PresenceEvent),
    Unread(UnreadEvent),
    DmNotification(NotificationEvent),
    ChannelNotification(NotificationEvent),
    MentionNotification(NotificationEvent),
    Membership(MembershipEvent),
    ServerError(ServerErrorEvent),
}

/// Typed event fan-out over the connection's decoded frame stream.
pub struct MessageStream {
    all_tx: broadcast::Sender<StreamEvent>,
    new_message_tx: broadcast::Sender<Message>,
    edited_tx: broadcast::Sender<Message>,
    deleted_tx: broadcast::Sender<MessageDeleted>,
    typing_tx: broadcast::Sender<TypingEvent>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    unread_tx: broadcast::Sender<UnreadEvent>,
    dm_tx: broadcast::Sender<NotificationEvent>,
    channel_tx: broadcast::Sender<NotificationEvent>,
    mention_tx: broadcast::Sender<NotificationEvent>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    error_tx: broadcast::Sender<ServerErrorEvent>,
    cancel: CancellationToken,
}

impl MessageStream {
    /// Spawn the demultiplexer over a decoded frame receiver.
    pub fn spawn(mut frames: broadcast::Receiver<ServerFrame>) -> Self {
        let stream = Self {
            all_tx: broadcast::channel(CHANNEL_BUFFER).0,
            new_message_tx: broadcast::channel(CHANNEL_BUFFER).0,
            edited_tx: broadcast::channel(CHANNEL_BUFFER).0,
            deleted_tx: broadcast::channel(CHANNEL_BUFFER).0,
            typing_tx: broadcast::channel(CHANNEL_BUFFER).0,
            presence_tx: broadcast::channel(CHANNEL_BUFFER).0,
            unread_tx: broadcast::channel(CHANNEL_BUFFER).0,
            dm_tx: broadcast::channel(CHANNEL_BUFFER).0,
            channel_tx: broadcast::channel(CHANNEL_BUFFER).0,
            mention_tx: broadcast::channel(CHANNEL_BUFFER).0,
            membership_tx: broadcast::channel(CHANNEL_BUFFER).0,
            error_tx: broadcast::channel(CHANNEL_BUFFER).0,
            cancel: CancellationToken::new(),
        };

        let fanout = stream.fanout_handles();
        let cancel = stream.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = frames.recv() => match next {
                        Ok(frame) => fanout.dispatch(frame),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "inbound frame stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        stream
    }

    /// Stop the demultiplexer task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Combined stream for the engine loop.
    pub fn subscribe_all(&self) -> broadcast::Receiver<StreamEvent> {
        self.all_tx.subscribe()
    }

    pub fn subscribe_new_messages(&self) -> broadcast::Receiver<Message> {
        self.new_message_tx.subscribe()
    }

    pub fn subscribe_edits(&self) -> broadcast::Receiver<Message> {
        self.edited_tx.subscribe()
    }

    pub fn subscribe_deletes(&self) -> broadcast::Receiver<MessageDeleted> {
        self.deleted_tx.subscribe()
    }

    pub fn subscribe_typing(&self) -> broadcast::Receiver<TypingEvent> {
        self.typing_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }

    pub fn subscribe_unread(&self) -> broadcast::Receiver<UnreadEvent> {
        self.unread_tx.subscribe()
    }

    pub fn subscribe_dm_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.dm_tx.subscribe()
    }

    pub fn subscribe_channel_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.channel_tx.subscribe()
    }

    pub fn subscribe_mention_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.mention_tx.subscribe()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ServerErrorEvent> {
        self.error_tx.subscribe()
    }

    fn fanout_handles(&self) -> Fanout {
        Fanout {
            all_tx: self.all_tx.clone(),
            new_message_tx: self.new_message_tx.clone(),
            edited_tx: self.edited_tx.clone(),
            deleted_tx: self.deleted_tx.clone(),
            typing_tx: self.typing_tx.clone(),
            presence_tx: self.presence_tx.clone(),
            unread_tx: self.unread_tx.clone(),
            dm_tx: self.dm_tx.clone(),
            channel_tx: self.channel_tx.clone(),
            mention_tx: self.mention_tx.clone(),
            membership_tx: self.membership_tx.clone(),
            error_tx: self.error_tx.clone(),
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Fanout {
    all_tx: broadcast::Sender<StreamEvent>,
    new_message_tx: broadcast::Sender<Message>,
    edited_tx: broadcast::Sender<Message>,
    deleted_tx: broadcast::Sender<MessageDeleted>,
    typing_tx: broadcast::Sender<TypingEvent>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    unread_tx: broadcast::Sender<UnreadEvent>,
    dm_tx: broadcast::Sender<NotificationEvent>,
    channel_tx: broadcast::Sender<NotificationEvent>,
    mention_tx: broadcast::Sender<NotificationEvent>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    error_tx: broadcast::Sender<ServerErrorEvent>,
}

impl Fanout {
    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ConnectionEstablished => debug!("connection established"),
            ServerFrame::ChannelJoined { channel_id } => {
                debug!(channel_id, "joined live channel");
            }
            ServerFrame::ChannelLeft { channel_id } => {
                debug!(channel_id, "left live channel");
            }
            ServerFrame::ReadReceipt { .. } => {}
            ServerFrame::NewMessage {
                message,
                channel_id,
                parent_id,
            } => match normalize_message(message, channel_id, parent_id) {
                Some(message) => {
                    let _ = self.new_message_tx.send(message.clone());
                    let _ = self.all_tx.send(StreamEvent::NewMessage(message));
                }
                None => warn!("dropping new_message with unresolved conversation"),
            },
            ServerFrame::MessageEdited {
                message,
                channel_id,
            } => {
                // Edits apply by message id; the conversation id is folded in
                // when present but is not required.
                let mut message = message;
                message.conversation = resolve_field(message.conversation.take(), channel_id);
                let _ = self.edited_tx.send(message.clone());
                let _ = self.all_tx.send(StreamEvent::MessageEdited(message));
            }
            ServerFrame::MessageDeleted {
                message_id,
                channel_id,
            } => {
                let event = MessageDeleted {
                    conversation_id: channel_id,
                    message_id,
                };
                let _ = self.deleted_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::MessageDeleted(event));
            }
            ServerFrame::TypingIndicator {
                user_id,
                username,
                display_name,
                channel_id,
                is_typing,
            } => {
                let event = TypingEvent {
                    conversation_id: channel_id,
                    user_id,
                    username,
                    display_name,
                    is_typing,
                };
                let _ = self.typing_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::Typing(event));
            }
            ServerFrame::PresenceUpdate {
                user_id,
                is_online,
                last_seen,
            } => {
                let event = PresenceEvent {
                    user_id,
                    is_online,
                    last_seen,
                };
                let _ = self.presence_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::Presence(event));
            }
            ServerFrame::UnreadUpdate {
                channel_id,
                unread_count,
            } => {
                let event = UnreadEvent {
                    conversation_id: channel_id,
                    unread_count,
                };
                let _ = self.unread_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::Unread(event));
            }
            ServerFrame::DmNotification {
                channel_id,
                message,
                sender_id,
            } => {
                let Some(event) = notification_event(channel_id, message, sender_id) else {
                    warn!("dropping dm_notification with unresolved conversation");
                    return;
                };
                let _ = self.dm_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::DmNotification(event));
            }
            ServerFrame::ChannelNotification {
                channel_id,
                message,
                sender_id,
            } => {
                let Some(event) = notification_event(channel_id, message, sender_id) else {
                    warn!("dropping channel_notification with unresolved conversation");
                    return;
                };
                let _ = self.channel_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::ChannelNotification(event));
            }
            ServerFrame::MentionNotification {
                channel_id,
                message,
                mentioner_id,
            } => {
                let Some(event) = notification_event(channel_id, message, mentioner_id) else {
                    warn!("dropping mention_notification with unresolved conversation");
                    return;
                };
                let _ = self.mention_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::MentionNotification(event));
            }
            ServerFrame::MemberJoined { channel_id, member } => {
                let event = MembershipEvent::Joined {
                    conversation_id: channel_id,
                    member,
                };
                let _ = self.membership_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::Membership(event));
            }
            ServerFrame::MemberLeft {
                channel_id,
                user_id,
            } => {
                let event = MembershipEvent::Left {
                    conversation_id: channel_id,
                    user_id,
                };
                let _ = self.membership_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::Membership(event));
            }
            ServerFrame::Error { error, code } => {
                let event = ServerErrorEvent { error, code };
                let _ = self.error_tx.send(event.clone());
                let _ = self.all_tx.send(StreamEvent::ServerError(event));
            }
            ServerFrame::Pong => {}
        }
    }
}

/// Resolve a notification's conversation id, preferring the nested message
/// payload over the top-level field.
fn notification_event(
    channel_id: Option<String>,
    mut message: Message,
    actor_id: String,
) -> Option<NotificationEvent> {
    let conversation_id = resolve_field(message.conversation.take(), channel_id)?;
    message.conversation = Some(conversation_id.clone());
    Some(NotificationEvent {
        conversation_id,
        message,
        actor_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(raw: &str) -> ServerFrame {
        beacon_core::decode_frame(raw).expect("frame should decode")
    }

    async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event receive")
    }

    #[tokio::test]
    async fn demultiplexes_new_messages_with_top_level_channel() {
        let (frame_tx, frame_rx) = broadcast::channel(16);
        let stream = MessageStream::spawn(frame_rx);
        let mut new_messages = stream.subscribe_new_messages();
        let mut all = stream.subscribe_all();

        frame_tx
            .send(frame(
                r#"{
                    "type": "new_message",
                    "channel_id": "c_1",
                    "message": {
                        "id": "m_1",
                        "user_id": "u_1",
                        "content": "hi",
                        "created_at": "2025-11-07T12:00:00Z"
                    }
                }"#,
            ))
            .expect("frame should send");

        let message = recv(&mut new_messages).await;
        assert_eq!(message.conversation.as_deref(), Some("c_1"));

        match recv(&mut all).await {
            StreamEvent::NewMessage(m) => assert_eq!(m.id, "m_1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefers_nested_conversation_for_notifications() {
        let (frame_tx, frame_rx) = broadcast::channel(16);
        let stream = MessageStream::spawn(frame_rx);
        let mut dm = stream.subscribe_dm_notifications();

        frame_tx
            .send(frame(
                r#"{
                    "type": "dm_notification",
                    "channel_id": "c_top",
                    "sender_id": "u_2",
                    "message": {
                        "id": "m_1",
                        "channel": "c_nested",
                        "user_id": "u_2",
                        "content": "hey",
                        "created_at": "2025-11-07T12:00:00Z"
                    }
                }"#,
            ))
            .expect("frame should send");

        let event = recv(&mut dm).await;
        assert_eq!(event.conversation_id, "c_nested");
        assert_eq!(event.actor_id, "u_2");
    }

    #[tokio::test]
    async fn drops_notification_with_unresolved_conversation() {
        let (frame_tx, frame_rx) = broadcast::channel(16);
        let stream = MessageStream::spawn(frame_rx);
        let mut mentions = stream.subscribe_mention_notifications();
        let mut errors = stream.subscribe_errors();

        frame_tx
            .send(frame(
                r#"{
                    "type": "mention_notification",
                    "mentioner_id": "u_2",
                    "message": {
                        "id": "m_1",
                        "user_id": "u_2",
                        "content": "@you",
                        "created_at": "2025-11-07T12:00:00Z"
                    }
                }"#,
            ))
            .expect("frame should send");
        // A subsequent error frame proves the dropped mention never arrives.
        frame_tx
            .send(frame(r#"{"type":"error","error":"boom"}"#))
            .expect("frame should send");

        let error = recv(&mut errors).await;
        assert_eq!(error.error, "boom");
        assert!(
            timeout(Duration::from_millis(100), mentions.recv())
                .await
                .is_err(),
            "unresolved mention must be dropped"
        );
    }

    #[tokio::test]
    async fn typing_and_unread_events_carry_conversation_ids() {
        let (frame_tx, frame_rx) = broadcast::channel(16);
        let stream = MessageStream::spawn(frame_rx);
        let mut typing = stream.subscribe_typing();
        let mut unread = stream.subscribe_unread();

        frame_tx
            .send(frame(
                r#"{
                    "type": "typing_indicator",
                    "user_id": "u_2",
                    "username": "sam",
                    "channel_id": "c_1",
                    "is_typing": true
                }"#,
            ))
            .expect("frame should send");
        frame_tx
            .send(frame(
                r#"{"type":"unread_update","channel_id":"c_2","unread_count":4}"#,
            ))
            .expect("frame should send");

        let typing_event = recv(&mut typing).await;
        assert_eq!(typing_event.conversation_id, "c_1");
        assert!(typing_event.is_typing);

        let unread_event = recv(&mut unread).await;
        assert_eq!(unread_event.conversation_id, "c_2");
        assert_eq!(unread_event.unread_count, 4);
    }
}
