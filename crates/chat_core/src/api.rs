use std::collections::HashSet;

use reqwest::{Client, StatusCode};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationSummary, MemberSummary, MessagePayload, SendMessageRequest},
};

use crate::error::ChatError;

/// Read-through REST adapter for the conversation directory and message
/// history endpoints. Payloads are deserialized into typed structs here,
/// at the boundary; nothing downstream sees raw JSON.
#[derive(Debug, Clone)]
pub struct ChatApi {
    http: Client,
    base_url: String,
}

impl ChatApi {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    /// Conversations the user participates in. Zero conversations is a
    /// valid empty result, not an error.
    pub async fn list_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations: Vec<ConversationSummary> = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .query(&[("userId", user_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    /// Member roster for a conversation, deduplicated by user id the same
    /// way the backend's join table can repeat rows.
    pub async fn list_members(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MemberSummary>, ChatError> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/members",
                self.base_url, conversation_id
            ))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ChatError::NotFound(conversation_id.clone()));
        }

        let members: Vec<MemberSummary> = response.error_for_status()?.json().await?;

        let mut seen_ids = HashSet::new();
        let mut deduped = Vec::with_capacity(members.len());
        for member in members {
            if seen_ids.insert(member.id.clone()) {
                deduped.push(member);
            }
        }
        Ok(deduped)
    }

    /// Message history in backend order (`sent_datetime` ascending per the
    /// backend contract). The order is preserved, never re-sorted locally.
    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessagePayload>, ChatError> {
        let messages: Vec<MessagePayload> = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    /// Fire-and-forget message write. The created message is not consumed
    /// from the response body; it round-trips back through the live
    /// channel instead.
    pub async fn post_message(&self, request: &SendMessageRequest) -> Result<(), ChatError> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.base_url, request.conversation_id
            ))
            .json(request)
            .send()
            .await
            .map_err(|err| ChatError::Send(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Send(format!("status {status}: {body}")));
        }
        Ok(())
    }
}
