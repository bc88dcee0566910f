//! REST collaborators for history, listings, and durable fallbacks.
//!
//! The engine consumes these through [`ConversationApi`] so tests can script
//! responses; [`HttpConversationApi`] is the production implementation.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::{
    classify_http_status, Conversation, ConversationMember, ConversationPage,
    CreateMessageRequest, EngineError, ErrorCategory, Message,
};
use serde::Serialize;

use crate::auth::AuthProvider;

/// Abstract REST contract of the chat backend.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Conversations the local user is a member of (channels, groups, DMs).
    async fn my_conversations(&self) -> Result<Vec<Conversation>, EngineError>;

    /// Browsable public conversations, cursor-paginated.
    async fn public_conversations(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ConversationPage, EngineError>;

    /// One conversation by id.
    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError>;

    /// Membership of a conversation.
    async fn members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMember>, EngineError>;

    /// Message history, newest first. `cursor` pages backward.
    async fn messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<Message>, EngineError>;

    /// Durable message write; the fallback when the live connection is down.
    async fn create_message(
        &self,
        request: &CreateMessageRequest,
    ) -> Result<Message, EngineError>;

    /// Durable read receipt; the fallback when `mark_read` cannot be
    /// transmitted over the socket.
    async fn mark_read(
        &self,
        conversation_id: &str,
        last_read_message_id: Option<&str>,
    ) -> Result<(), EngineError>;
}

/// `reqwest`-backed implementation of [`ConversationApi`].
pub struct HttpConversationApi {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            auth,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, EngineError> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|err| request_error(operation, err))?;

        decode_response(operation, response).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, EngineError> {
        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|err| request_error(operation, err))?;

        decode_response(operation, response).await
    }

    fn user_id_query(&self) -> Vec<(&'static str, String)> {
        match self.auth.current_user_id() {
            Some(user_id) => vec![("user_id", user_id)],
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn my_conversations(&self) -> Result<Vec<Conversation>, EngineError> {
        self.get_json(
            "my_conversations",
            "/chat/channels/my_channels/",
            &self.user_id_query(),
        )
        .await
    }

    async fn public_conversations(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ConversationPage, EngineError> {
        let mut query = self.user_id_query();
        query.push(("limit", limit.to_string()));
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_owned()));
        }
        self.get_json("public_conversations", "/chat/channels/public/", &query)
            .await
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        self.get_json(
            "conversation",
            &format!("/chat/channels/{conversation_id}/"),
            &[],
        )
        .await
    }

    async fn members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMember>, EngineError> {
        self.get_json(
            "members",
            &format!("/chat/channels/{conversation_id}/members/"),
            &[],
        )
        .await
    }

    async fn messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<Message>, EngineError> {
        let mut query = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_owned()));
        }
        self.get_json(
            "messages",
            &format!("/chat/channels/{conversation_id}/messages/"),
            &query,
        )
        .await
    }

    async fn create_message(
        &self,
        request: &CreateMessageRequest,
    ) -> Result<Message, EngineError> {
        self.post_json("create_message", "/chat/messages/", request)
            .await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        last_read_message_id: Option<&str>,
    ) -> Result<(), EngineError> {
        #[derive(Serialize)]
        struct MarkReadBody<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            last_read_message_id: Option<&'a str>,
        }

        let token = self.auth.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/chat/channels/{conversation_id}/mark_read/",
                self.base_url
            ))
            .bearer_auth(token)
            .json(&MarkReadBody {
                last_read_message_id,
            })
            .send()
            .await
            .map_err(|err| request_error("mark_read", err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("mark_read", status.as_u16()));
        }
        Ok(())
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, EngineError> {
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(operation, status.as_u16()));
    }

    response.json::<T>().await.map_err(|err| {
        EngineError::new(
            ErrorCategory::Serialization,
            "response_decode_error",
            format!("{operation}: {err}"),
        )
    })
}

fn request_error(operation: &'static str, err: reqwest::Error) -> EngineError {
    EngineError::new(
        ErrorCategory::Fetch,
        "request_failed",
        format!("{operation}: {err}"),
    )
}

fn status_error(operation: &'static str, status: u16) -> EngineError {
    EngineError::new(
        classify_http_status(status),
        "http_status_error",
        format!("{operation}: unexpected status {status}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let auth = Arc::new(crate::auth::StaticAuthProvider::new("tok", "u_1"));
        let api = HttpConversationApi::new("https://chat.example.com/api/", auth);
        assert_eq!(api.base_url, "https://chat.example.com/api");
    }

    #[test]
    fn status_errors_keep_classification() {
        let err = status_error("messages", 503);
        assert_eq!(err.category, ErrorCategory::Fetch);
        let err = status_error("messages", 401);
        assert_eq!(err.category, ErrorCategory::Auth);
    }
}
