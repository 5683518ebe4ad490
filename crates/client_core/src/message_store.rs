//! Ordered, deduplicated per-conversation message logs.
//!
//! Each log is kept sorted by `(created_at, key)`. Confirmed messages are
//! unique by server id; optimistic messages are keyed by their local id until
//! they are reconciled with the server echo.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{
    ConversationId, DeliveryState, LocalId, Message, MessageId, MessageKey, UserId,
};

use crate::notifications::UnreadTally;

/// Window inside which a confirmed message may stand in for an optimistic
/// one with the same sender and content but a different id.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(2);

/// Content of a message the local user is about to send.
#[derive(Debug, Clone)]
pub struct Draft {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
    /// The message replaced an optimistic entry matched by sender, content
    /// and timestamp window.
    Superseded(LocalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Replaced,
    Appended,
    AlreadyPresent,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub superseded: Vec<LocalId>,
}

#[derive(Debug, Default)]
struct ConversationLog {
    entries: Vec<Message>,
    confirmed_ids: HashSet<MessageId>,
    read_ids: HashSet<MessageId>,
}

impl ConversationLog {
    fn insert_sorted(&mut self, message: Message) {
        let position = self
            .entries
            .partition_point(|existing| existing.order_key() <= message.order_key());
        if let Some(id) = message.server_id() {
            self.confirmed_ids.insert(id.clone());
        }
        self.entries.insert(position, message);
    }

    fn position_of_key(&self, key: &MessageKey) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.key == key)
    }

    fn sent_before_ack_match(
        &self,
        message: &Message,
        window: chrono::Duration,
    ) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                matches!(entry.key, MessageKey::Local(_))
                    && entry.sender_id == message.sender_id
                    && entry.content == message.content
                    && (entry.created_at - message.created_at).abs() <= window
            })
            .min_by_key(|(_, entry)| (entry.created_at - message.created_at).abs())
            .map(|(index, _)| index)
    }

    fn is_unread(&self, message: &Message) -> bool {
        message
            .server_id()
            .is_some_and(|id| !self.read_ids.contains(id))
    }

    fn mark_read_where(&mut self, read: impl Fn(&Message) -> bool) {
        for entry in self.entries.iter().filter(|entry| read(entry)) {
            if let Some(id) = entry.server_id() {
                self.read_ids.insert(id.clone());
            }
        }
    }
}

#[derive(Debug)]
pub struct MessageStore {
    logs: HashMap<ConversationId, ConversationLog>,
    unconfirmed: HashMap<LocalId, ConversationId>,
    duplicate_window: chrono::Duration,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW)
    }
}

impl MessageStore {
    pub fn new(duplicate_window: Duration) -> Self {
        Self {
            logs: HashMap::new(),
            unconfirmed: HashMap::new(),
            duplicate_window: chrono::Duration::from_std(duplicate_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(2)),
        }
    }

    /// Inserts in sort order. Re-delivery of a known id is a no-op.
    pub fn append(&mut self, mut message: Message) -> AppendOutcome {
        let window = self.duplicate_window;
        let log = self.logs.entry(message.conversation_id.clone()).or_default();

        match &message.key {
            MessageKey::Server(id) => {
                if log.confirmed_ids.contains(id) {
                    return AppendOutcome::Duplicate;
                }
                if let Some(index) = log.sent_before_ack_match(&message, window) {
                    let optimistic = log.entries.remove(index);
                    if let MessageKey::Local(local_id) = optimistic.key {
                        self.unconfirmed.remove(&local_id);
                        message.local_id = Some(local_id.clone());
                        message.delivery = DeliveryState::Confirmed;
                        log.insert_sorted(message);
                        return AppendOutcome::Superseded(local_id);
                    }
                }
                log.insert_sorted(message);
                AppendOutcome::Inserted
            }
            MessageKey::Local(local_id) => {
                if log.position_of_key(&message.key).is_some() {
                    return AppendOutcome::Duplicate;
                }
                self.unconfirmed
                    .insert(local_id.clone(), message.conversation_id.clone());
                log.insert_sorted(message);
                AppendOutcome::Inserted
            }
        }
    }

    /// Appends a batch, typically a REST history page followed by buffered
    /// live events.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> MergeReport {
        let mut report = MergeReport::default();
        for message in messages {
            match self.append(message) {
                AppendOutcome::Inserted => report.inserted += 1,
                AppendOutcome::Duplicate => report.duplicates += 1,
                AppendOutcome::Superseded(local_id) => report.superseded.push(local_id),
            }
        }
        report
    }

    /// Inserts a `pending` entry for a send that has not been acknowledged.
    /// Inserting the same local id again resets it to `pending`.
    pub fn insert_optimistic(&mut self, local_id: LocalId, draft: Draft) -> LocalId {
        let key = MessageKey::Local(local_id.clone());
        let log = self.logs.entry(draft.conversation_id.clone()).or_default();
        if let Some(index) = log.position_of_key(&key) {
            log.entries[index].delivery = DeliveryState::Pending;
            return local_id;
        }

        self.unconfirmed
            .insert(local_id.clone(), draft.conversation_id.clone());
        log.insert_sorted(Message {
            key,
            local_id: Some(local_id.clone()),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            content: draft.content,
            created_at: draft.created_at,
            delivery: DeliveryState::Pending,
        });
        local_id
    }

    /// Replaces the optimistic entry for `local_id` with the confirmed
    /// message. Leaves at most one entry for the send whatever the order of
    /// echoes and history merges.
    pub fn reconcile(&mut self, local_id: &LocalId, mut server: Message) -> ReconcileOutcome {
        server.local_id = Some(local_id.clone());
        server.delivery = DeliveryState::Confirmed;

        let key = MessageKey::Local(local_id.clone());
        let mut removed_optimistic = false;
        let owner = self
            .unconfirmed
            .remove(local_id)
            .unwrap_or_else(|| server.conversation_id.clone());
        if let Some(log) = self.logs.get_mut(&owner) {
            if let Some(index) = log.position_of_key(&key) {
                log.entries.remove(index);
                removed_optimistic = true;
            }
        }

        let log = self.logs.entry(server.conversation_id.clone()).or_default();
        let already_present = server
            .server_id()
            .is_some_and(|id| log.confirmed_ids.contains(id));
        if already_present {
            return ReconcileOutcome::AlreadyPresent;
        }
        log.insert_sorted(server);
        if removed_optimistic {
            ReconcileOutcome::Replaced
        } else {
            ReconcileOutcome::Appended
        }
    }

    /// Marks an unconfirmed send as failed. Returns whether an entry changed.
    pub fn mark_failed(&mut self, local_id: &LocalId) -> bool {
        self.set_unconfirmed_state(local_id, DeliveryState::Failed)
    }

    /// Puts a failed send back to `pending` ahead of a retry.
    pub fn mark_pending(&mut self, local_id: &LocalId) -> bool {
        self.set_unconfirmed_state(local_id, DeliveryState::Pending)
    }

    fn set_unconfirmed_state(&mut self, local_id: &LocalId, state: DeliveryState) -> bool {
        let Some(conversation_id) = self.unconfirmed.get(local_id) else {
            return false;
        };
        let key = MessageKey::Local(local_id.clone());
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return false;
        };
        match log.position_of_key(&key) {
            Some(index) if log.entries[index].delivery != state => {
                log.entries[index].delivery = state;
                true
            }
            _ => false,
        }
    }

    pub fn find_unconfirmed(&self, local_id: &LocalId) -> Option<&Message> {
        let conversation_id = self.unconfirmed.get(local_id)?;
        let log = self.logs.get(conversation_id)?;
        let key = MessageKey::Local(local_id.clone());
        log.position_of_key(&key).map(|index| &log.entries[index])
    }

    /// Drops an unconfirmed entry, e.g. when the user discards a failed send.
    pub fn remove_unconfirmed(&mut self, local_id: &LocalId) -> Option<Message> {
        let conversation_id = self.unconfirmed.remove(local_id)?;
        let log = self.logs.get_mut(&conversation_id)?;
        let index = log.position_of_key(&MessageKey::Local(local_id.clone()))?;
        Some(log.entries.remove(index))
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.logs
            .get(conversation_id)
            .map(|log| log.entries.as_slice())
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.logs.keys()
    }

    /// Marks every confirmed message in the log as read. Read state is kept
    /// per server id, so messages that sort earlier but arrive later stay
    /// unread.
    pub fn mark_read(&mut self, conversation_id: &ConversationId) {
        if let Some(log) = self.logs.get_mut(conversation_id) {
            log.mark_read_where(|_| true);
        }
    }

    pub fn mark_read_from(&mut self, conversation_id: &ConversationId, sender_id: &UserId) {
        if let Some(log) = self.logs.get_mut(conversation_id) {
            log.mark_read_where(|entry| &entry.sender_id == sender_id);
        }
    }

    pub fn mark_ids_read(
        &mut self,
        conversation_id: &ConversationId,
        ids: impl IntoIterator<Item = MessageId>,
    ) {
        if let Some(log) = self.logs.get_mut(conversation_id) {
            log.read_ids.extend(ids);
        }
    }

    /// Recomputes unread counts per sender from the log: confirmed messages
    /// from other users that have not been marked read.
    pub fn unread_tally(
        &self,
        conversation_id: &ConversationId,
        local_user: &UserId,
    ) -> HashMap<UserId, UnreadTally> {
        let mut tallies: HashMap<UserId, UnreadTally> = HashMap::new();
        let Some(log) = self.logs.get(conversation_id) else {
            return tallies;
        };
        for message in log
            .entries
            .iter()
            .filter(|m| &m.sender_id != local_user && log.is_unread(m))
        {
            tallies
                .entry(message.sender_id.clone())
                .or_insert_with(|| UnreadTally::empty(message.sender_name.clone()))
                .record(message);
        }
        tallies
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
