//! Idempotent join/leave bookkeeping for conversation rooms.
//!
//! The tracker never talks to the transport. It returns [`MembershipAction`]s
//! tagged with the connection generation they belong to and leaves sending
//! them to the caller.

use std::{collections::HashMap, time::Duration};

use shared::domain::{ConversationId, JoinState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_JOIN_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    Join {
        conversation_id: ConversationId,
        generation: u64,
    },
    Leave {
        conversation_id: ConversationId,
        generation: u64,
    },
    Joined {
        conversation_id: ConversationId,
        generation: u64,
    },
    JoinFailed {
        conversation_id: ConversationId,
        reason: String,
    },
}

#[derive(Debug)]
struct RoomEntry {
    state: JoinState,
    generation: Option<u64>,
    retries: u32,
    ack_deadline: Option<Instant>,
}

impl RoomEntry {
    fn idle() -> Self {
        Self {
            state: JoinState::NotJoined,
            generation: None,
            retries: 0,
            ack_deadline: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::idle();
    }
}

#[derive(Debug)]
pub struct RoomMembershipTracker {
    /// Desired rooms. Presence in the map is what "desired" means.
    rooms: HashMap<ConversationId, RoomEntry>,
    live_generation: Option<u64>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl Default for RoomMembershipTracker {
    fn default() -> Self {
        Self::new(DEFAULT_JOIN_ACK_TIMEOUT, DEFAULT_JOIN_MAX_RETRIES)
    }
}

impl RoomMembershipTracker {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            rooms: HashMap::new(),
            live_generation: None,
            ack_timeout,
            max_retries,
        }
    }

    pub fn mark_desired(
        &mut self,
        conversation_id: &ConversationId,
        now: Instant,
    ) -> Vec<MembershipAction> {
        let entry = self
            .rooms
            .entry(conversation_id.clone())
            .or_insert_with(RoomEntry::idle);
        let Some(generation) = self.live_generation else {
            return Vec::new();
        };
        if entry.state != JoinState::NotJoined && entry.generation == Some(generation) {
            debug!(
                conversation_id = %conversation_id,
                generation,
                state = ?entry.state,
                "rooms: join already in flight or complete"
            );
            return Vec::new();
        }
        entry.retries = 0;
        vec![Self::issue_join(
            entry,
            conversation_id,
            generation,
            now + self.ack_timeout,
        )]
    }

    pub fn mark_undesired(&mut self, conversation_id: &ConversationId) -> Vec<MembershipAction> {
        let Some(entry) = self.rooms.remove(conversation_id) else {
            return Vec::new();
        };
        match (self.live_generation, entry.state) {
            (Some(generation), JoinState::Joined | JoinState::Joining) => {
                vec![MembershipAction::Leave {
                    conversation_id: conversation_id.clone(),
                    generation,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Re-issues joins for every desired room under the new generation.
    pub fn on_connected(&mut self, generation: u64, now: Instant) -> Vec<MembershipAction> {
        self.live_generation = Some(generation);
        let deadline = now + self.ack_timeout;
        let mut actions = Vec::with_capacity(self.rooms.len());
        for (conversation_id, entry) in self.rooms.iter_mut() {
            entry.reset();
            actions.push(Self::issue_join(entry, conversation_id, generation, deadline));
        }
        if !actions.is_empty() {
            info!(generation, rooms = actions.len(), "rooms: rejoining desired rooms");
        }
        actions
    }

    /// Joins do not survive the transport; desired rooms are kept.
    pub fn on_disconnected(&mut self) {
        self.live_generation = None;
        for entry in self.rooms.values_mut() {
            entry.reset();
        }
    }

    pub fn on_room_joined(
        &mut self,
        conversation_id: &ConversationId,
        generation: u64,
    ) -> Vec<MembershipAction> {
        if self.live_generation != Some(generation) {
            return Vec::new();
        }
        let Some(entry) = self.rooms.get_mut(conversation_id) else {
            debug!(
                conversation_id = %conversation_id,
                generation,
                "rooms: join ack for undesired room"
            );
            return vec![MembershipAction::Leave {
                conversation_id: conversation_id.clone(),
                generation,
            }];
        };
        if entry.state != JoinState::Joining || entry.generation != Some(generation) {
            return Vec::new();
        }
        entry.state = JoinState::Joined;
        entry.ack_deadline = None;
        entry.retries = 0;
        vec![MembershipAction::Joined {
            conversation_id: conversation_id.clone(),
            generation,
        }]
    }

    pub fn on_join_error(
        &mut self,
        conversation_id: &ConversationId,
        generation: u64,
        reason: &str,
    ) -> Vec<MembershipAction> {
        if self.live_generation != Some(generation) {
            return Vec::new();
        }
        let Some(entry) = self.rooms.get_mut(conversation_id) else {
            return Vec::new();
        };
        warn!(
            conversation_id = %conversation_id,
            generation,
            reason,
            "rooms: join rejected"
        );
        entry.reset();
        vec![MembershipAction::JoinFailed {
            conversation_id: conversation_id.clone(),
            reason: reason.to_string(),
        }]
    }

    /// Retries joins whose ack is overdue; gives up after `max_retries`.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<MembershipAction> {
        let Some(generation) = self.live_generation else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for (conversation_id, entry) in self.rooms.iter_mut() {
            let overdue = entry.state == JoinState::Joining
                && entry.ack_deadline.is_some_and(|deadline| deadline <= now);
            if !overdue {
                continue;
            }
            if entry.retries < self.max_retries {
                entry.retries += 1;
                warn!(
                    conversation_id = %conversation_id,
                    generation,
                    attempt = entry.retries,
                    "rooms: join ack timed out, retrying"
                );
                actions.push(Self::issue_join(
                    entry,
                    conversation_id,
                    generation,
                    now + self.ack_timeout,
                ));
            } else {
                warn!(
                    conversation_id = %conversation_id,
                    generation,
                    "rooms: join ack timed out, giving up"
                );
                entry.reset();
                actions.push(MembershipAction::JoinFailed {
                    conversation_id: conversation_id.clone(),
                    reason: "join acknowledgement timed out".to_string(),
                });
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.rooms
            .values()
            .filter_map(|entry| entry.ack_deadline)
            .min()
    }

    pub fn join_state(&self, conversation_id: &ConversationId) -> JoinState {
        self.rooms
            .get(conversation_id)
            .map(|entry| entry.state)
            .unwrap_or(JoinState::NotJoined)
    }

    pub fn is_desired(&self, conversation_id: &ConversationId) -> bool {
        self.rooms.contains_key(conversation_id)
    }

    pub fn desired(&self) -> impl Iterator<Item = &ConversationId> {
        self.rooms.keys()
    }

    pub fn live_generation(&self) -> Option<u64> {
        self.live_generation
    }

    fn issue_join(
        entry: &mut RoomEntry,
        conversation_id: &ConversationId,
        generation: u64,
        deadline: Instant,
    ) -> MembershipAction {
        entry.state = JoinState::Joining;
        entry.generation = Some(generation);
        entry.ack_deadline = Some(deadline);
        MembershipAction::Join {
            conversation_id: conversation_id.clone(),
            generation,
        }
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
