use shared::domain::ConversationId;
use thiserror::Error;

/// Failure taxonomy for the chat core. Read failures never invalidate
/// data already cached for other conversations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("live channel error: {0}")]
    Channel(String),
    #[error("message send failed: {0}")]
    Send(String),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("conversation {0} has no open live channel")]
    ChannelNotOpen(ConversationId),
    #[error("invalid backend base url: {0}")]
    InvalidBaseUrl(String),
}
