//! Inbound frame decoding and field normalization.
//!
//! The wire format is inconsistent about where a new-message event carries
//! its conversation id and parent id: they may appear nested inside the
//! message payload or at the top level of the frame. Normalization prefers
//! the nested value and falls back to the top-level one; events whose
//! conversation cannot be resolved at all are dropped by the caller.

use crate::error::EngineError;
use crate::types::{Message, ServerFrame};

/// Decode one inbound frame.
///
/// Unknown tags and malformed payloads produce a [`Decode`] error the stream
/// layer logs and drops without failing the connection.
///
/// [`Decode`]: crate::error::ErrorCategory::Decode
pub fn decode_frame(raw: &str) -> Result<ServerFrame, EngineError> {
    serde_json::from_str::<ServerFrame>(raw).map_err(|err| EngineError::decode(err.to_string()))
}

/// Resolve a possibly split field, preferring the nested location.
pub fn resolve_field(nested: Option<String>, top_level: Option<String>) -> Option<String> {
    nested.or(top_level)
}

/// Fold top-level conversation/parent ids into a message payload.
///
/// Returns `None` when no conversation id can be resolved from either
/// location; such an event must not be propagated.
pub fn normalize_message(
    mut message: Message,
    channel_id: Option<String>,
    parent_id: Option<String>,
) -> Option<Message> {
    message.conversation = resolve_field(message.conversation.take(), channel_id);
    if message.conversation.is_none() {
        return None;
    }
    message.parent = resolve_field(message.parent.take(), parent_id);
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bare_message(conversation: Option<&str>) -> Message {
        Message {
            id: "m_1".into(),
            temp_id: None,
            conversation: conversation.map(str::to_owned),
            user_id: Some("u_1".into()),
            username: None,
            display_name: None,
            content: "hello".into(),
            parent: None,
            reply_count: 0,
            created_at: Utc::now(),
            updated_at: None,
            edited_at: None,
            deleted_at: None,
            is_edited: false,
            is_deleted: false,
            attachments: Vec::new(),
            delivery: Default::default(),
        }
    }

    #[test]
    fn prefers_nested_conversation_over_top_level() {
        let normalized = normalize_message(bare_message(Some("c_nested")), Some("c_top".into()), None)
            .expect("conversation should resolve");
        assert_eq!(normalized.conversation.as_deref(), Some("c_nested"));
    }

    #[test]
    fn falls_back_to_top_level_conversation() {
        let normalized = normalize_message(bare_message(None), Some("c_top".into()), None)
            .expect("conversation should resolve");
        assert_eq!(normalized.conversation.as_deref(), Some("c_top"));
    }

    #[test]
    fn drops_message_with_unresolved_conversation() {
        assert!(normalize_message(bare_message(None), None, None).is_none());
    }

    #[test]
    fn resolves_parent_from_top_level_when_missing() {
        let normalized = normalize_message(
            bare_message(Some("c_1")),
            None,
            Some("m_parent".into()),
        )
        .expect("conversation should resolve");
        assert_eq!(normalized.parent.as_deref(), Some("m_parent"));
    }

    #[test]
    fn decodes_new_message_with_top_level_channel() {
        let frame = decode_frame(
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
        )
        .expect("frame should decode");

        match frame {
            ServerFrame::NewMessage {
                message,
                channel_id,
                ..
            } => {
                assert_eq!(message.conversation, None);
                assert_eq!(channel_id.as_deref(), Some("c_1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_tag_with_decode_error() {
        let err = decode_frame(r#"{"type":"mystery"}"#).expect_err("unknown tag must fail");
        assert_eq!(err.code, "frame_decode_error");
    }

    #[test]
    fn rejects_malformed_json_with_decode_error() {
        let err = decode_frame("{not json").expect_err("malformed frame must fail");
        assert_eq!(err.code, "frame_decode_error");
    }
}
