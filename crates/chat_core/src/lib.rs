use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::ConversationId,
    protocol::{
        ConversationSummary, MemberSummary, MessagePayload, SendMessageRequest, UserProfile,
    },
};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

pub mod api;
pub mod cache;
pub mod channel;
pub mod error;

pub use api::ChatApi;
pub use cache::{ConversationCache, ConversationEntry};
pub use channel::{ChannelState, KEEPALIVE_INTERVAL};
pub use error::ChatError;

use channel::LiveChannelHandle;

/// Context handed to the chat module at construction time. The core never
/// reads ambient state; the authenticated user and backend location both
/// arrive here.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub current_user: UserProfile,
    pub backend_base_url: String,
    pub keepalive_interval: Duration,
}

impl ChatConfig {
    pub fn new(current_user: UserProfile, backend_base_url: impl Into<String>) -> Self {
        Self {
            current_user,
            backend_base_url: backend_base_url.into(),
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Everything the presentation layer needs to render arrives on this feed.
/// Payload-carrying events are keyed by conversation id so a consumer that
/// switched away can filter stale ones.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ConversationsLoaded(Vec<ConversationSummary>),
    MembersLoaded {
        conversation_id: ConversationId,
        members: Vec<MemberSummary>,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        messages: Vec<MessagePayload>,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    ChannelStateChanged {
        conversation_id: ConversationId,
        state: ChannelState,
    },
    Error(String),
}

struct ChatState {
    cache: ConversationCache,
    conversations: Vec<ConversationSummary>,
    selected: Option<ConversationId>,
    channel_state: ChannelState,
}

/// Session-scoped chat module: directory and history clients, conversation
/// cache, merge/dedup layer, live update channel, and composer. All cache
/// mutation is serialized through `inner`, so a dedup check and its insert
/// always complete before the next queued event is processed.
pub struct ChatClient {
    api: ChatApi,
    config: ChatConfig,
    base_url: String,
    inner: Mutex<ChatState>,
    live: Mutex<Option<LiveChannelHandle>>,
    events: broadcast::Sender<ChatEvent>,
}

/// Seam between the chat core and any presentation layer.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError>;
    async fn select_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<(), ChatError>;
    async fn members(&self, conversation_id: &ConversationId) -> Vec<MemberSummary>;
    async fn messages(&self, conversation_id: &ConversationId) -> Vec<MessagePayload>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent>;
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Result<Arc<Self>, ChatError> {
        let base = Url::parse(&config.backend_base_url).map_err(|err| {
            ChatError::InvalidBaseUrl(format!("{}: {err}", config.backend_base_url))
        })?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(ChatError::InvalidBaseUrl(format!(
                "{}: expected http or https",
                config.backend_base_url
            )));
        }

        let mut base_url = base.to_string();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Arc::new(Self {
            api: ChatApi::new(Client::new(), base_url.clone()),
            config,
            base_url,
            inner: Mutex::new(ChatState {
                cache: ConversationCache::default(),
                conversations: Vec::new(),
                selected: None,
                channel_state: ChannelState::Closed,
            }),
            live: Mutex::new(None),
            events,
        }))
    }

    pub fn current_user(&self) -> &UserProfile {
        &self.config.current_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Conversations the current user belongs to. An empty list is a valid
    /// result rendered as an empty state, never an error.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self
            .api
            .list_conversations(&self.config.current_user.id)
            .await?;
        {
            let mut guard = self.inner.lock().await;
            guard.conversations = conversations.clone();
        }
        let _ = self
            .events
            .send(ChatEvent::ConversationsLoaded(conversations.clone()));
        Ok(conversations)
    }

    /// Make `conversation_id` the active conversation: close the previous
    /// live channel, populate the cache on first access, and open a fresh
    /// channel. On a cache hit the cached snapshot is surfaced immediately
    /// and a background refresh backfills anything missed while no channel
    /// was open.
    pub async fn select_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), ChatError> {
        let (needs_members, needs_history) = {
            let mut guard = self.inner.lock().await;
            guard.selected = Some(conversation_id.clone());
            (
                !guard.cache.members_loaded(&conversation_id),
                !guard.cache.history_loaded(&conversation_id),
            )
        };

        self.close_live_channel().await;

        if needs_members {
            let members = self.api.list_members(&conversation_id).await?;
            let still_selected = {
                let mut guard = self.inner.lock().await;
                guard
                    .cache
                    .populate_members(conversation_id.clone(), members.clone());
                guard.selected.as_ref() == Some(&conversation_id)
            };
            if still_selected {
                let _ = self.events.send(ChatEvent::MembersLoaded {
                    conversation_id: conversation_id.clone(),
                    members,
                });
            }
        }

        if needs_history {
            let messages = self.api.list_messages(&conversation_id).await?;
            // population is keyed by the id captured at request time, so a
            // response resolving after a selection switch can never land in
            // another conversation's entry; it is also a no-op if live
            // appends got there first
            let still_selected = {
                let mut guard = self.inner.lock().await;
                guard
                    .cache
                    .populate_messages(conversation_id.clone(), messages);
                guard.selected.as_ref() == Some(&conversation_id)
            };
            if still_selected {
                let snapshot = self.messages(&conversation_id).await;
                let _ = self.events.send(ChatEvent::HistoryLoaded {
                    conversation_id: conversation_id.clone(),
                    messages: snapshot,
                });
            }
        } else {
            let (members, messages) = {
                let guard = self.inner.lock().await;
                match guard.cache.get(&conversation_id) {
                    Some(entry) => (entry.members().to_vec(), entry.messages().to_vec()),
                    None => (Vec::new(), Vec::new()),
                }
            };
            let _ = self.events.send(ChatEvent::MembersLoaded {
                conversation_id: conversation_id.clone(),
                members,
            });
            let _ = self.events.send(ChatEvent::HistoryLoaded {
                conversation_id: conversation_id.clone(),
                messages,
            });

            let client = Arc::clone(self);
            let refresh_id = conversation_id.clone();
            tokio::spawn(async move { client.backfill_history(refresh_id).await });
        }

        let still_selected =
            { self.inner.lock().await.selected.as_ref() == Some(&conversation_id) };
        if still_selected {
            self.open_live_channel(conversation_id).await;
        }
        Ok(())
    }

    /// Composer contract: trimmed-empty content is rejected locally, the
    /// target must be the selected conversation with an open channel, and
    /// there is no optimistic insert. The echo arrives over the live
    /// channel and is appended exactly once via the dedup path. On failure
    /// the caller keeps the input text for retry.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        {
            let guard = self.inner.lock().await;
            let selected = guard.selected.as_ref() == Some(&conversation_id);
            if !selected || guard.channel_state != ChannelState::Open {
                return Err(ChatError::ChannelNotOpen(conversation_id));
            }
        }

        let request = SendMessageRequest {
            from_user: self.config.current_user.id.clone(),
            content: content.to_string(),
            sent_datetime: Utc::now(),
            conversation_id,
        };
        self.api.post_message(&request).await
    }

    /// Current merged member roster, empty when not yet loaded.
    pub async fn members(&self, conversation_id: &ConversationId) -> Vec<MemberSummary> {
        let guard = self.inner.lock().await;
        guard
            .cache
            .get(conversation_id)
            .map(|entry| entry.members().to_vec())
            .unwrap_or_default()
    }

    /// Current merged message sequence, empty when not yet loaded.
    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<MessagePayload> {
        let guard = self.inner.lock().await;
        guard
            .cache
            .get(conversation_id)
            .map(|entry| entry.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.selected.clone()
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.inner.lock().await.channel_state
    }

    /// Teardown: closes the live channel. Cached conversations stay
    /// readable for the rest of the session.
    pub async fn close(&self) {
        self.close_live_channel().await;
    }

    /// Re-fetch history and run every message through the append/dedup
    /// path. Used on re-selection to fill gaps left by a dropped channel;
    /// duplicates are no-ops, genuinely missed messages append at the end.
    async fn backfill_history(&self, conversation_id: ConversationId) {
        match self.api.list_messages(&conversation_id).await {
            Ok(messages) => {
                for message in messages {
                    self.append_to_cache(&conversation_id, message).await;
                }
            }
            Err(err) => {
                let _ = self.events.send(ChatEvent::Error(format!(
                    "history refresh failed for conversation {conversation_id}: {err}"
                )));
            }
        }
    }

    /// Merge layer entry point shared by live frames and backfill. The
    /// append is atomic under the state lock; only genuinely new messages
    /// produce a `MessageAppended` event.
    async fn append_to_cache(&self, conversation_id: &ConversationId, message: MessagePayload) {
        if message.conversation_id != *conversation_id {
            warn!(
                expected = conversation_id.as_str(),
                received = message.conversation_id.as_str(),
                "dropping message addressed to another conversation"
            );
            return;
        }
        let appended = {
            let mut guard = self.inner.lock().await;
            guard
                .cache
                .append_message(conversation_id.clone(), message.clone())
        };
        if appended {
            let _ = self.events.send(ChatEvent::MessageAppended {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
    }

    /// Transition the channel state only while `conversation_id` is still
    /// the active selection. Returns whether the transition applied; a
    /// `false` means a later selection owns the state now and the caller
    /// must not touch it.
    async fn transition_if_selected(
        &self,
        conversation_id: &ConversationId,
        state: ChannelState,
    ) -> bool {
        let applied = {
            let mut guard = self.inner.lock().await;
            if guard.selected.as_ref() == Some(conversation_id) {
                guard.channel_state = state;
                true
            } else {
                false
            }
        };
        if applied {
            let _ = self.events.send(ChatEvent::ChannelStateChanged {
                conversation_id: conversation_id.clone(),
                state,
            });
        }
        applied
    }

    async fn close_live_channel(&self) {
        let previous = { self.live.lock().await.take() };
        if let Some(handle) = previous {
            let conversation_id = handle.conversation_id.clone();
            handle.close();
            {
                self.inner.lock().await.channel_state = ChannelState::Closed;
            }
            let _ = self.events.send(ChatEvent::ChannelStateChanged {
                conversation_id,
                state: ChannelState::Closed,
            });
            info!("live channel closed");
        }
    }

    /// Open the push connection for the selected conversation and spawn
    /// its reader and keep-alive tasks. A connection failure is surfaced
    /// as a non-fatal error event; cached history stays visible and no
    /// automatic reconnect is attempted.
    async fn open_live_channel(self: &Arc<Self>, conversation_id: ConversationId) {
        if !self
            .transition_if_selected(&conversation_id, ChannelState::Connecting)
            .await
        {
            return;
        }

        let ws_url = match channel::ws_endpoint(&self.base_url, &conversation_id) {
            Ok(url) => url,
            Err(err) => {
                self.transition_if_selected(&conversation_id, ChannelState::Closed)
                    .await;
                let _ = self.events.send(ChatEvent::Error(err.to_string()));
                return;
            }
        };

        let stream = match connect_async(&ws_url).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                // if the selection moved on while the connect was in
                // flight, the new channel owns the state; leave it alone
                if self
                    .transition_if_selected(&conversation_id, ChannelState::Closed)
                    .await
                {
                    let _ = self.events.send(ChatEvent::Error(
                        ChatError::Channel(format!(
                            "failed to open live channel for conversation {conversation_id}: {err}"
                        ))
                        .to_string(),
                    ));
                }
                return;
            }
        };

        // a stale open resolving after a selection switch must not install
        // its handle over the current channel; dropping the stream here
        // closes the socket
        let mut live = self.live.lock().await;
        if !self
            .transition_if_selected(&conversation_id, ChannelState::Open)
            .await
        {
            return;
        }
        info!(
            conversation_id = conversation_id.as_str(),
            "live channel open"
        );

        let (mut ws_writer, mut ws_reader) = stream.split();

        let keepalive_interval = self.config.keepalive_interval;
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            // the first tick completes immediately; liveness signals start
            // one full interval after open
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ws_writer.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        let reader_id = conversation_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<MessagePayload>(&text) {
                            Ok(message) => client.append_to_cache(&reader_id, message).await,
                            Err(err) => {
                                warn!(
                                    conversation_id = reader_id.as_str(),
                                    "dropping malformed live frame: {err}"
                                );
                                let _ = client.events.send(ChatEvent::Error(format!(
                                    "invalid live channel frame: {err}"
                                )));
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(ChatEvent::Error(format!(
                            "live channel receive failed: {err}"
                        )));
                        break;
                    }
                }
            }

            // transport gone: mark closed unless a later selection already
            // replaced this channel
            let still_current = {
                let mut guard = client.inner.lock().await;
                if guard.selected.as_ref() == Some(&reader_id)
                    && guard.channel_state != ChannelState::Closed
                {
                    guard.channel_state = ChannelState::Closed;
                    true
                } else {
                    false
                }
            };
            if still_current {
                let _ = client.events.send(ChatEvent::ChannelStateChanged {
                    conversation_id: reader_id,
                    state: ChannelState::Closed,
                });
            }
        });

        let replaced = live.replace(LiveChannelHandle::new(conversation_id, reader, keepalive));
        if let Some(previous) = replaced {
            previous.close();
        }
    }
}

#[async_trait]
impl ChatHandle for Arc<ChatClient> {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        ChatClient::list_conversations(self).await
    }

    async fn select_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        ChatClient::select_conversation(self, conversation_id).await
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<(), ChatError> {
        ChatClient::send_message(self, conversation_id, content).await
    }

    async fn members(&self, conversation_id: &ConversationId) -> Vec<MemberSummary> {
        ChatClient::members(self, conversation_id).await
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Vec<MessagePayload> {
        ChatClient::messages(self, conversation_id).await
    }

    async fn close(&self) {
        ChatClient::close(self).await;
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        ChatClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
