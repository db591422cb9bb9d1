use std::time::Duration;

use shared::domain::ConversationId;
use tokio::task::JoinHandle;

use crate::error::ChatError;

/// Ping cadence while a channel is open, chosen to stay under common
/// idle-timeout windows on proxies and load balancers.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Lifecycle of the per-conversation push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Connecting,
    Open,
}

/// Running tasks behind one open live channel. Dropping the handle alone
/// does not stop the tasks; `close` aborts both, which also drops the
/// socket halves and tears down the connection.
pub(crate) struct LiveChannelHandle {
    pub conversation_id: ConversationId,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl LiveChannelHandle {
    pub fn new(
        conversation_id: ConversationId,
        reader: JoinHandle<()>,
        keepalive: JoinHandle<()>,
    ) -> Self {
        Self {
            conversation_id,
            reader,
            keepalive,
        }
    }

    pub fn close(self) {
        self.reader.abort();
        self.keepalive.abort();
    }
}

/// Push endpoint for one conversation, derived from the backend base URL.
pub(crate) fn ws_endpoint(
    base_url: &str,
    conversation_id: &ConversationId,
) -> Result<String, ChatError> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ChatError::InvalidBaseUrl(format!(
            "{base_url}: expected http or https"
        )));
    };
    Ok(format!("{ws_base}/ws/conversations/{conversation_id}"))
}
