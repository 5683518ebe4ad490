//! Unread counts per (conversation, sender) for messages that arrive outside
//! the focused conversation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, Message, UserId};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadAggregate {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub count: u32,
    pub latest_message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// What a mark-read intent applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadTarget {
    Conversation(ConversationId),
    Sender(UserId),
}

/// Unread figures for one sender recomputed from a message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadTally {
    pub sender_name: String,
    pub count: u32,
    pub latest_message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UnreadTally {
    pub fn empty(sender_name: String) -> Self {
        Self {
            sender_name,
            count: 0,
            latest_message: None,
            last_updated: None,
        }
    }

    pub fn record(&mut self, message: &Message) {
        self.count += 1;
        if self.last_updated.map_or(true, |at| message.created_at >= at) {
            self.latest_message = Some(message.content.clone());
            self.last_updated = Some(message.created_at);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    /// Senders with unread messages, most recent first.
    pub entries: Vec<UnreadAggregate>,
    pub total: u32,
}

impl UnreadSnapshot {
    pub fn has_unread(&self) -> bool {
        self.total > 0
    }
}

#[derive(Debug, Default)]
pub struct NotificationAggregator {
    entries: HashMap<(ConversationId, UserId), UnreadAggregate>,
}

impl NotificationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a newly delivered message. Returns whether anything changed.
    pub fn on_inbound_message(
        &mut self,
        message: &Message,
        is_focused_conversation: bool,
    ) -> bool {
        if is_focused_conversation {
            return false;
        }
        let aggregate = self
            .entries
            .entry((message.conversation_id.clone(), message.sender_id.clone()))
            .or_insert_with(|| UnreadAggregate {
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: message.sender_name.clone(),
                count: 0,
                latest_message: None,
                last_updated: None,
            });
        aggregate.count += 1;
        aggregate.sender_name = message.sender_name.clone();
        if aggregate
            .last_updated
            .map_or(true, |at| message.created_at >= at)
        {
            aggregate.latest_message = Some(message.content.clone());
            aggregate.last_updated = Some(message.created_at);
        }
        true
    }

    /// Zeroes every aggregate the target covers and returns the
    /// conversations that were touched. Idempotent.
    pub fn mark_read(&mut self, target: &ReadTarget) -> Vec<ConversationId> {
        let mut touched = Vec::new();
        for aggregate in self.entries.values_mut().filter(|aggregate| match target {
            ReadTarget::Conversation(id) => &aggregate.conversation_id == id,
            ReadTarget::Sender(id) => &aggregate.sender_id == id,
        }) {
            aggregate.count = 0;
            if !touched.contains(&aggregate.conversation_id) {
                touched.push(aggregate.conversation_id.clone());
            }
        }
        touched
    }

    pub fn get(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
    ) -> Option<&UnreadAggregate> {
        self.entries.get(&(conversation_id.clone(), sender_id.clone()))
    }

    pub fn conversations_with_unread_from(&self, sender_id: &UserId) -> Vec<ConversationId> {
        self.entries
            .values()
            .filter(|aggregate| &aggregate.sender_id == sender_id && aggregate.count > 0)
            .map(|aggregate| aggregate.conversation_id.clone())
            .collect()
    }

    pub fn total(&self) -> u32 {
        self.entries.values().map(|aggregate| aggregate.count).sum()
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        let mut entries: Vec<UnreadAggregate> = self
            .entries
            .values()
            .filter(|aggregate| aggregate.count > 0)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.sender_id.cmp(&b.sender_id))
        });
        let total = entries.iter().map(|aggregate| aggregate.count).sum();
        UnreadSnapshot { entries, total }
    }

    /// Replaces the counts for one conversation with figures recomputed from
    /// its message log. Returns whether any drift was corrected.
    pub fn reconcile_conversation(
        &mut self,
        conversation_id: &ConversationId,
        recomputed: HashMap<UserId, UnreadTally>,
    ) -> bool {
        let mut drifted = false;

        for aggregate in self
            .entries
            .values_mut()
            .filter(|aggregate| &aggregate.conversation_id == conversation_id)
        {
            let expected = recomputed
                .get(&aggregate.sender_id)
                .map(|tally| tally.count)
                .unwrap_or(0);
            if aggregate.count != expected {
                warn!(
                    conversation_id = %conversation_id,
                    sender_id = %aggregate.sender_id,
                    counted = aggregate.count,
                    expected,
                    "notify: unread drift corrected"
                );
                aggregate.count = expected;
                drifted = true;
            }
        }

        for (sender_id, tally) in recomputed {
            let key = (conversation_id.clone(), sender_id.clone());
            if self.entries.contains_key(&key) || tally.count == 0 {
                continue;
            }
            warn!(
                conversation_id = %conversation_id,
                sender_id = %sender_id,
                expected = tally.count,
                "notify: unread drift corrected"
            );
            self.entries.insert(
                key,
                UnreadAggregate {
                    conversation_id: conversation_id.clone(),
                    sender_id,
                    sender_name: tally.sender_name,
                    count: tally.count,
                    latest_message: tally.latest_message,
                    last_updated: tally.last_updated,
                },
            );
            drifted = true;
        }

        drifted
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
