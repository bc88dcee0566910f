//! Encodes user intents into wire frames, with REST fallback where the
//! contract demands durability.

use std::sync::Arc;

use beacon_core::ClientFrame;
use tracing::{debug, warn};

use crate::api::ConversationApi;
use crate::connection::ConnectionManager;

/// Outbound action encoder over the live connection.
///
/// Every call reports whether the frame was actually transmitted. Read
/// receipts must not be silently lost, so `mark_read` falls back to the REST
/// collaborator on transmission failure; the fallback itself is best-effort
/// and only logged.
pub struct ActionDispatcher {
    conn: Arc<ConnectionManager>,
    api: Arc<dyn ConversationApi>,
}

impl ActionDispatcher {
    pub fn new(conn: Arc<ConnectionManager>, api: Arc<dyn ConversationApi>) -> Self {
        Self { conn, api }
    }

    pub async fn join(&self, conversation_id: &str) {
        self.conn.join_conversation(conversation_id).await;
    }

    pub async fn leave(&self, conversation_id: &str) {
        self.conn.leave_conversation(conversation_id).await;
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        parent_id: Option<&str>,
        provisional_id: Option<&str>,
        attachment_ids: &[String],
    ) -> bool {
        self.conn
            .send(&ClientFrame::SendMessage {
                channel_id: conversation_id.to_owned(),
                content: content.to_owned(),
                parent_id: parent_id.map(str::to_owned),
                temp_id: provisional_id.map(str::to_owned),
                attachment_ids: if attachment_ids.is_empty() {
                    None
                } else {
                    Some(attachment_ids.to_vec())
                },
            })
            .await
    }

    pub async fn edit_message(&self, message_id: &str, content: &str) -> bool {
        self.conn
            .send(&ClientFrame::EditMessage {
                message_id: message_id.to_owned(),
                content: content.to_owned(),
            })
            .await
    }

    pub async fn delete_message(&self, message_id: &str) -> bool {
        self.conn
            .send(&ClientFrame::DeleteMessage {
                message_id: message_id.to_owned(),
            })
            .await
    }

    pub async fn typing_start(&self, conversation_id: &str) -> bool {
        self.conn
            .send(&ClientFrame::TypingStart {
                channel_id: conversation_id.to_owned(),
            })
            .await
    }

    pub async fn typing_stop(&self, conversation_id: &str) -> bool {
        self.conn
            .send(&ClientFrame::TypingStop {
                channel_id: conversation_id.to_owned(),
            })
            .await
    }

    /// Transmit a read receipt, falling back to REST when the socket is
    /// unavailable.
    pub async fn mark_read(&self, conversation_id: &str, last_read_message_id: Option<&str>) {
        let sent = self
            .conn
            .send(&ClientFrame::MarkRead {
                channel_id: conversation_id.to_owned(),
                last_read_message_id: last_read_message_id.map(str::to_owned),
            })
            .await;

        if sent {
            return;
        }

        debug!(conversation_id, "mark_read transmission failed, using REST fallback");
        if let Err(err) = self.api.mark_read(conversation_id, last_read_message_id).await {
            warn!(conversation_id, error = %err, "mark_read REST fallback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use beacon_core::{
        Conversation, ConversationMember, ConversationPage, CreateMessageRequest, EngineError,
        ErrorCategory, Message,
    };

    use crate::auth::StaticAuthProvider;
    use crate::config::EngineConfig;

    #[derive(Default)]
    struct RecordingApi {
        mark_read_calls: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl ConversationApi for RecordingApi {
        async fn my_conversations(&self) -> Result<Vec<Conversation>, EngineError> {
            Ok(Vec::new())
        }

        async fn public_conversations(
            &self,
            _limit: u32,
            _cursor: Option<&str>,
        ) -> Result<ConversationPage, EngineError> {
            Ok(ConversationPage {
                results: Vec::new(),
                next_cursor: None,
                count: 0,
            })
        }

        async fn conversation(&self, id: &str) -> Result<Conversation, EngineError> {
            Err(EngineError::new(
                ErrorCategory::Fetch,
                "not_found",
                format!("unknown conversation {id}"),
            ))
        }

        async fn members(&self, _id: &str) -> Result<Vec<ConversationMember>, EngineError> {
            Ok(Vec::new())
        }

        async fn messages(
            &self,
            _id: &str,
            _cursor: Option<&str>,
        ) -> Result<Vec<Message>, EngineError> {
            Ok(Vec::new())
        }

        async fn create_message(
            &self,
            _request: &CreateMessageRequest,
        ) -> Result<Message, EngineError> {
            Err(EngineError::new(ErrorCategory::Send, "unsupported", "test"))
        }

        async fn mark_read(
            &self,
            conversation_id: &str,
            last_read_message_id: Option<&str>,
        ) -> Result<(), EngineError> {
            self.mark_read_calls
                .lock()
                .expect("lock")
                .push((
                    conversation_id.to_owned(),
                    last_read_message_id.map(str::to_owned),
                ));
            Ok(())
        }
    }

    fn dispatcher(api: Arc<RecordingApi>) -> ActionDispatcher {
        let config = EngineConfig::new("ws://127.0.0.1:9", "http://127.0.0.1:9")
            .expect("config should build");
        let conn = ConnectionManager::new(&config, Arc::new(StaticAuthProvider::new("tok", "u_me")));
        ActionDispatcher::new(conn, api)
    }

    #[tokio::test]
    async fn send_reports_untransmitted_without_socket() {
        let api = Arc::new(RecordingApi::default());
        let dispatcher = dispatcher(api);

        let sent = dispatcher
            .send_message("c_1", "hello", None, Some("local-1"), &[])
            .await;
        assert!(!sent);
        assert!(!dispatcher.edit_message("m_1", "new").await);
        assert!(!dispatcher.typing_start("c_1").await);
    }

    #[tokio::test]
    async fn mark_read_falls_back_to_rest_when_socket_is_down() {
        let api = Arc::new(RecordingApi::default());
        let dispatcher = dispatcher(Arc::clone(&api));

        dispatcher.mark_read("c_1", Some("m_9")).await;

        let calls = api.mark_read_calls.lock().expect("lock");
        assert_eq!(
            calls.as_slice(),
            &[("c_1".to_owned(), Some("m_9".to_owned()))]
        );
    }
}
