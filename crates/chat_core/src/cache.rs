use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationId, MessageId},
    protocol::{MemberSummary, MessagePayload},
};

/// Per-conversation cached state: member roster plus the merged,
/// duplicate-free message sequence.
#[derive(Debug, Default, Clone)]
pub struct ConversationEntry {
    members: Vec<MemberSummary>,
    messages: Vec<MessagePayload>,
    seen: HashSet<MessageId>,
    members_loaded: bool,
    history_loaded: bool,
}

impl ConversationEntry {
    pub fn members(&self) -> &[MemberSummary] {
        &self.members
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }
}

/// Session-scoped cache keyed by conversation id. All mutation happens
/// under the owning client's state lock, so each operation is atomic with
/// respect to the event flow: the dedup check and the insert can never be
/// interleaved with another mutation.
#[derive(Debug, Default)]
pub struct ConversationCache {
    entries: HashMap<ConversationId, ConversationEntry>,
}

impl ConversationCache {
    /// `None` is the not-yet-loaded sentinel.
    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationEntry> {
        self.entries.get(conversation_id)
    }

    pub fn members_loaded(&self, conversation_id: &ConversationId) -> bool {
        self.entries
            .get(conversation_id)
            .is_some_and(|entry| entry.members_loaded)
    }

    pub fn history_loaded(&self, conversation_id: &ConversationId) -> bool {
        self.entries
            .get(conversation_id)
            .is_some_and(|entry| entry.history_loaded)
    }

    /// First-population only. Members are deduplicated by id; a repeat
    /// population is a no-op. Returns whether the roster was applied.
    pub fn populate_members(
        &mut self,
        conversation_id: ConversationId,
        members: Vec<MemberSummary>,
    ) -> bool {
        let entry = self.entries.entry(conversation_id).or_default();
        if entry.members_loaded {
            return false;
        }

        let mut seen_ids = HashSet::new();
        for member in members {
            if seen_ids.insert(member.id.clone()) {
                entry.members.push(member);
            }
        }
        entry.members_loaded = true;
        true
    }

    /// First-population only, and only while the message sequence is still
    /// empty: a slow history response arriving after live appends must not
    /// overwrite or truncate them. Returns whether the history was applied.
    pub fn populate_messages(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<MessagePayload>,
    ) -> bool {
        let entry = self.entries.entry(conversation_id).or_default();
        if entry.history_loaded || !entry.messages.is_empty() {
            entry.history_loaded = true;
            return false;
        }

        for message in messages {
            if entry.seen.insert(message.message_id.clone()) {
                entry.messages.push(message);
            }
        }
        entry.history_loaded = true;
        true
    }

    /// Deduplicating append: no-op when the `message_id` is already cached,
    /// otherwise the message lands at the end of the sequence. Arrival
    /// order is preserved; the channel is trusted to deliver in causal
    /// order.
    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        message: MessagePayload,
    ) -> bool {
        let entry = self.entries.entry(conversation_id).or_default();
        if !entry.seen.insert(message.message_id.clone()) {
            return false;
        }
        entry.messages.push(message);
        true
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
