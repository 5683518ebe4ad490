//! Conversation lifecycle orchestration.
//!
//! [`SyncController`] is the only writer of the message store and the unread
//! aggregates. It is sans-IO: every operation takes the current [`Instant`]
//! and returns [`SyncAction`]s for the runtime to carry out (transmit a frame,
//! fetch history, post over REST, publish an event).
//!
//! Per conversation the phase runs `Closed -> LoadingHistory -> Live ->
//! Closed`. Live events that arrive while history is loading are buffered and
//! merged after the history page, so REST and socket delivery may overlap in
//! any order.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationId, DeliveryState, JoinState, LocalId, Message, MessageId, SubjectRef,
        UserId,
    },
    protocol::{ClientRequest, ConversationSummary},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    connection::{InboundEvent, TransportEvent},
    error::SyncError,
    membership::{
        MembershipAction, RoomMembershipTracker, DEFAULT_JOIN_ACK_TIMEOUT,
        DEFAULT_JOIN_MAX_RETRIES,
    },
    message_store::{AppendOutcome, Draft, MessageStore, DEFAULT_DUPLICATE_WINDOW},
    notifications::{NotificationAggregator, ReadTarget, UnreadSnapshot},
};

pub const DEFAULT_SEND_ACK_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimeouts {
    pub join_ack: Duration,
    pub join_max_retries: u32,
    pub send_ack: Duration,
    pub duplicate_window: Duration,
}

impl Default for SyncTimeouts {
    fn default() -> Self {
        Self {
            join_ack: DEFAULT_JOIN_ACK_TIMEOUT,
            join_max_retries: DEFAULT_JOIN_MAX_RETRIES,
            send_ack: DEFAULT_SEND_ACK_TIMEOUT,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }
}

/// The signed-in user, as stamped on optimistic messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationPhase {
    Closed,
    LoadingHistory,
    Live,
    HistoryFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_ids: BTreeSet<UserId>,
    pub subject_ref: Option<SubjectRef>,
    pub join_state: JoinState,
    pub phase: ConversationPhase,
    pub last_message_preview: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Notifications for the view layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseChanged {
        conversation_id: ConversationId,
        phase: ConversationPhase,
    },
    MessagesChanged {
        conversation_id: ConversationId,
    },
    JoinStateChanged {
        conversation_id: ConversationId,
        join_state: JoinState,
    },
    JoinFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    Delivered {
        conversation_id: ConversationId,
        local_id: LocalId,
    },
    DeliveryFailed {
        conversation_id: ConversationId,
        local_id: LocalId,
    },
    UnreadChanged {
        total: u32,
    },
    ConversationsUpdated,
    ConnectionChanged {
        generation: u64,
        connected: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Transmit {
        generation: u64,
        request: ClientRequest,
    },
    FetchHistory {
        conversation_id: ConversationId,
        epoch: u64,
    },
    PostMessage {
        conversation_id: ConversationId,
        local_id: LocalId,
        content: String,
    },
    Emit(SyncEvent),
}

#[derive(Debug)]
enum Phase {
    Closed,
    Loading {
        epoch: u64,
        buffered: Vec<(Message, Option<LocalId>)>,
    },
    Live,
    Failed {
        reason: String,
    },
}

impl Phase {
    fn public(&self) -> ConversationPhase {
        match self {
            Self::Closed => ConversationPhase::Closed,
            Self::Loading { .. } => ConversationPhase::LoadingHistory,
            Self::Live => ConversationPhase::Live,
            Self::Failed { reason } => ConversationPhase::HistoryFailed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct ConversationRecord {
    participant_ids: BTreeSet<UserId>,
    subject_ref: Option<SubjectRef>,
    last_message_preview: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    phase: Phase,
}

impl ConversationRecord {
    fn new(local_user: &UserId) -> Self {
        Self {
            participant_ids: BTreeSet::from([local_user.clone()]),
            subject_ref: None,
            last_message_preview: None,
            updated_at: None,
            phase: Phase::Closed,
        }
    }

    fn note_message(&mut self, message: &Message) {
        self.participant_ids.insert(message.sender_id.clone());
        if self.updated_at.map_or(true, |at| message.created_at >= at) {
            self.last_message_preview = Some(message.content.clone());
            self.updated_at = Some(message.created_at);
        }
    }
}

#[derive(Debug)]
struct OutstandingSend {
    conversation_id: ConversationId,
    deadline: Instant,
}

pub struct SyncController {
    identity: LocalIdentity,
    timeouts: SyncTimeouts,
    store: MessageStore,
    rooms: RoomMembershipTracker,
    unread: NotificationAggregator,
    conversations: HashMap<ConversationId, ConversationRecord>,
    focused: Option<ConversationId>,
    outstanding: HashMap<LocalId, OutstandingSend>,
    last_epoch: u64,
    generation: Option<u64>,
    highest_generation: u64,
}

impl SyncController {
    pub fn new(identity: LocalIdentity, timeouts: SyncTimeouts) -> Self {
        Self {
            identity,
            timeouts,
            store: MessageStore::new(timeouts.duplicate_window),
            rooms: RoomMembershipTracker::new(timeouts.join_ack, timeouts.join_max_retries),
            unread: NotificationAggregator::new(),
            conversations: HashMap::new(),
            focused: None,
            outstanding: HashMap::new(),
            last_epoch: 0,
            generation: None,
            highest_generation: 0,
        }
    }

    /// Focuses the conversation, marks it read and, unless it is already
    /// open, starts a history fetch alongside the room join.
    pub fn open(&mut self, conversation_id: &ConversationId, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        self.focused = Some(conversation_id.clone());
        self.mark_conversation_read(conversation_id, &mut actions);

        let record = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationRecord::new(&self.identity.user_id));
        match record.phase {
            Phase::Loading { .. } | Phase::Live => {
                debug!(conversation_id = %conversation_id, "sync: conversation already open");
            }
            Phase::Closed | Phase::Failed { .. } => {
                self.last_epoch += 1;
                let epoch = self.last_epoch;
                record.phase = Phase::Loading {
                    epoch,
                    buffered: Vec::new(),
                };
                info!(conversation_id = %conversation_id, epoch, "sync: loading history");
                actions.push(SyncAction::FetchHistory {
                    conversation_id: conversation_id.clone(),
                    epoch,
                });
                actions.push(SyncAction::Emit(SyncEvent::PhaseChanged {
                    conversation_id: conversation_id.clone(),
                    phase: ConversationPhase::LoadingHistory,
                }));
            }
        }

        let membership = self.rooms.mark_desired(conversation_id, now);
        self.apply_membership(membership, &mut actions);
        actions
    }

    /// Applies a history response. Responses whose epoch no longer matches
    /// the conversation's load are dropped.
    pub fn history_loaded(
        &mut self,
        conversation_id: &ConversationId,
        epoch: u64,
        result: Result<Vec<Message>, String>,
    ) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let Some(record) = self.conversations.get_mut(conversation_id) else {
            return actions;
        };
        let buffered = match &mut record.phase {
            Phase::Loading {
                epoch: current,
                buffered,
            } if *current == epoch => std::mem::take(buffered),
            _ => {
                debug!(
                    conversation_id = %conversation_id,
                    epoch,
                    "sync: discarding stale history response"
                );
                return actions;
            }
        };

        let history = match result {
            Ok(history) => {
                record.phase = Phase::Live;
                history
            }
            Err(reason) => {
                warn!(conversation_id = %conversation_id, reason = %reason, "sync: history fetch failed");
                record.phase = Phase::Failed {
                    reason: reason.clone(),
                };
                actions.push(SyncAction::Emit(SyncEvent::PhaseChanged {
                    conversation_id: conversation_id.clone(),
                    phase: ConversationPhase::HistoryFailed { reason },
                }));
                Vec::new()
            }
        };
        let phase = record.phase.public();
        for message in &history {
            record.note_message(message);
        }

        // History is never unread; only live arrivals are counted.
        let history_ids: Vec<MessageId> = history
            .iter()
            .filter_map(|message| message.server_id().cloned())
            .collect();
        let report = self.store.merge(history);
        self.store.mark_ids_read(conversation_id, history_ids);
        for local_id in report.superseded {
            self.settle_delivered(conversation_id, local_id, &mut actions);
        }
        debug!(
            conversation_id = %conversation_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            buffered = buffered.len(),
            "sync: history merged"
        );
        for (message, local_id) in buffered {
            self.ingest(message, local_id, &mut actions);
        }

        actions.push(SyncAction::Emit(SyncEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        }));
        if phase == ConversationPhase::Live {
            actions.push(SyncAction::Emit(SyncEvent::PhaseChanged {
                conversation_id: conversation_id.clone(),
                phase,
            }));
        }
        actions
    }

    /// Inserts an optimistic message and dispatches it, over the transport
    /// when live and over REST otherwise.
    pub fn send(
        &mut self,
        conversation_id: &ConversationId,
        content: &str,
        now: Instant,
        created_at: DateTime<Utc>,
    ) -> Result<(LocalId, Vec<SyncAction>), SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.require_live(conversation_id)?;

        let local_id = self.store.insert_optimistic(
            LocalId::generate(),
            Draft {
                conversation_id: conversation_id.clone(),
                sender_id: self.identity.user_id.clone(),
                sender_name: self.identity.display_name.clone(),
                content: content.to_string(),
                created_at,
            },
        );
        if let Some(record) = self.conversations.get_mut(conversation_id) {
            if let Some(message) = self.store.find_unconfirmed(&local_id) {
                record.note_message(message);
            }
        }

        let mut actions = Vec::new();
        self.dispatch_send(conversation_id, &local_id, content, now, &mut actions);
        actions.push(SyncAction::Emit(SyncEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        }));
        Ok((local_id, actions))
    }

    /// Re-sends a failed message under its original local id.
    pub fn retry(&mut self, local_id: &LocalId, now: Instant) -> Result<Vec<SyncAction>, SyncError> {
        let message = self
            .store
            .find_unconfirmed(local_id)
            .ok_or_else(|| SyncError::UnknownLocalId(local_id.clone()))?;
        if message.delivery != DeliveryState::Failed {
            return Err(SyncError::NotFailed(local_id.clone()));
        }
        let conversation_id = message.conversation_id.clone();
        let content = message.content.clone();
        self.require_live(&conversation_id)?;

        self.store.mark_pending(local_id);
        let mut actions = Vec::new();
        self.dispatch_send(&conversation_id, local_id, &content, now, &mut actions);
        actions.push(SyncAction::Emit(SyncEvent::MessagesChanged { conversation_id }));
        Ok(actions)
    }

    /// Removes a failed message from its log.
    pub fn discard(&mut self, local_id: &LocalId) -> Result<Vec<SyncAction>, SyncError> {
        let message = self
            .store
            .find_unconfirmed(local_id)
            .ok_or_else(|| SyncError::UnknownLocalId(local_id.clone()))?;
        if message.delivery != DeliveryState::Failed {
            return Err(SyncError::NotFailed(local_id.clone()));
        }
        let conversation_id = message.conversation_id.clone();
        self.store.remove_unconfirmed(local_id);
        self.outstanding.remove(local_id);
        Ok(vec![SyncAction::Emit(SyncEvent::MessagesChanged {
            conversation_id,
        })])
    }

    /// Result of a REST fallback send.
    pub fn post_completed(
        &mut self,
        local_id: &LocalId,
        result: Result<Message, String>,
    ) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match result {
            Ok(message) => self.ingest(message, Some(local_id.clone()), &mut actions),
            Err(reason) => {
                if let Some(send) = self.outstanding.remove(local_id) {
                    warn!(local_id = %local_id, reason = %reason, "sync: fallback post failed");
                    self.fail_send(local_id, send.conversation_id, &mut actions);
                }
            }
        }
        actions
    }

    /// Leaves the room and closes the conversation. The log stays cached;
    /// events buffered during a pending history load are kept in it.
    pub fn close(&mut self, conversation_id: &ConversationId) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let membership = self.rooms.mark_undesired(conversation_id);
        self.apply_membership(membership, &mut actions);

        let previous = self
            .conversations
            .get_mut(conversation_id)
            .map(|record| std::mem::replace(&mut record.phase, Phase::Closed))
            .unwrap_or(Phase::Closed);
        let was_open = !matches!(previous, Phase::Closed);
        if let Phase::Loading { buffered, .. } = previous {
            for (message, local_id) in buffered {
                self.ingest(message, local_id, &mut actions);
            }
        }
        if self.focused.as_ref() == Some(conversation_id) {
            self.focused = None;
        }
        if !was_open {
            return actions;
        }
        info!(conversation_id = %conversation_id, "sync: conversation closed");
        actions.push(SyncAction::Emit(SyncEvent::PhaseChanged {
            conversation_id: conversation_id.clone(),
            phase: ConversationPhase::Closed,
        }));
        actions
    }

    /// Zeroes the aggregates the target covers. A sender target leaves other
    /// senders in the same conversations unread.
    pub fn mark_read(&mut self, target: &ReadTarget) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match target {
            ReadTarget::Conversation(conversation_id) => {
                self.mark_conversation_read(conversation_id, &mut actions);
            }
            ReadTarget::Sender(sender_id) => {
                for conversation_id in &self.unread.conversations_with_unread_from(sender_id) {
                    self.store.mark_read_from(conversation_id, sender_id);
                }
                let before = self.unread.total();
                self.unread.mark_read(target);
                let total = self.unread.total();
                if total != before {
                    actions.push(SyncAction::Emit(SyncEvent::UnreadChanged { total }));
                }
            }
        }
        actions
    }

    pub fn apply_conversation_list(&mut self, summaries: Vec<ConversationSummary>) -> Vec<SyncAction> {
        for summary in summaries {
            let record = self
                .conversations
                .entry(summary.id.clone())
                .or_insert_with(|| ConversationRecord::new(&self.identity.user_id));
            record.participant_ids.extend(
                summary
                    .participants
                    .iter()
                    .map(|participant| UserId::new(participant.id())),
            );
            if summary.subject.is_some() {
                record.subject_ref = summary.subject;
            }
            let newer = match (summary.updated_at, record.updated_at) {
                (Some(incoming), Some(known)) => incoming > known,
                (Some(_), None) => true,
                (None, known) => known.is_none(),
            };
            if newer {
                if summary.last_message.is_some() {
                    record.last_message_preview = summary.last_message;
                }
                record.updated_at = summary.updated_at.or(record.updated_at);
            }
        }
        vec![SyncAction::Emit(SyncEvent::ConversationsUpdated)]
    }

    pub fn handle_transport(&mut self, event: TransportEvent, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        match event {
            TransportEvent::Connected { generation } => {
                let reconnect = self.highest_generation > 0;
                self.generation = Some(generation);
                self.highest_generation = self.highest_generation.max(generation);
                actions.push(SyncAction::Emit(SyncEvent::ConnectionChanged {
                    generation,
                    connected: true,
                }));
                let membership = self.rooms.on_connected(generation, now);
                self.apply_membership(membership, &mut actions);
                if reconnect {
                    self.reconcile_unread(&mut actions);
                }
            }
            TransportEvent::Disconnected { generation, reason } => {
                if self.generation != Some(generation) {
                    debug!(generation, "sync: ignoring disconnect of superseded connection");
                    return actions;
                }
                info!(generation, reason = reason.as_deref().unwrap_or("local"), "sync: transport down");
                self.generation = None;
                self.rooms.on_disconnected();
                actions.push(SyncAction::Emit(SyncEvent::ConnectionChanged {
                    generation,
                    connected: false,
                }));
            }
            TransportEvent::Inbound { generation, event } => {
                if self.generation != Some(generation) {
                    debug!(
                        generation,
                        current = ?self.generation,
                        "sync: dropping event from stale generation"
                    );
                    return actions;
                }
                match event {
                    InboundEvent::RoomJoined { conversation_id } => {
                        let membership = self.rooms.on_room_joined(&conversation_id, generation);
                        self.apply_membership(membership, &mut actions);
                    }
                    InboundEvent::JoinError {
                        conversation_id,
                        reason,
                    } => {
                        let membership =
                            self.rooms.on_join_error(&conversation_id, generation, &reason);
                        self.apply_membership(membership, &mut actions);
                    }
                    InboundEvent::MessageReceived { message, local_id } => {
                        self.on_message_received(message, local_id, &mut actions);
                    }
                }
            }
        }
        actions
    }

    /// Fires join retries and send-ack timeouts that are due.
    pub fn tick(&mut self, now: Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let membership = self.rooms.poll_timeouts(now);
        self.apply_membership(membership, &mut actions);

        let expired: Vec<LocalId> = self
            .outstanding
            .iter()
            .filter(|(_, send)| send.deadline <= now)
            .map(|(local_id, _)| local_id.clone())
            .collect();
        for local_id in expired {
            if let Some(send) = self.outstanding.remove(&local_id) {
                warn!(
                    conversation_id = %send.conversation_id,
                    local_id = %local_id,
                    "sync: send acknowledgement timed out"
                );
                self.fail_send(&local_id, send.conversation_id, &mut actions);
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let sends = self.outstanding.values().map(|send| send.deadline).min();
        match (self.rooms.next_deadline(), sends) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.store.messages(conversation_id).to_vec()
    }

    pub fn phase(&self, conversation_id: &ConversationId) -> ConversationPhase {
        self.conversations
            .get(conversation_id)
            .map(|record| record.phase.public())
            .unwrap_or(ConversationPhase::Closed)
    }

    pub fn join_state(&self, conversation_id: &ConversationId) -> JoinState {
        self.rooms.join_state(conversation_id)
    }

    /// Known conversations, most recently active first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|(conversation_id, record)| self.describe(conversation_id, record))
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn unread(&self) -> UnreadSnapshot {
        self.unread.snapshot()
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    fn describe(&self, conversation_id: &ConversationId, record: &ConversationRecord) -> Conversation {
        Conversation {
            id: conversation_id.clone(),
            participant_ids: record.participant_ids.clone(),
            subject_ref: record.subject_ref.clone(),
            join_state: self.rooms.join_state(conversation_id),
            phase: record.phase.public(),
            last_message_preview: record.last_message_preview.clone(),
            updated_at: record.updated_at,
        }
    }

    fn require_live(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        match self.conversations.get(conversation_id).map(|record| &record.phase) {
            Some(Phase::Live) => Ok(()),
            _ => Err(SyncError::NotLive(conversation_id.clone())),
        }
    }

    fn dispatch_send(
        &mut self,
        conversation_id: &ConversationId,
        local_id: &LocalId,
        content: &str,
        now: Instant,
        actions: &mut Vec<SyncAction>,
    ) {
        self.outstanding.insert(
            local_id.clone(),
            OutstandingSend {
                conversation_id: conversation_id.clone(),
                deadline: now + self.timeouts.send_ack,
            },
        );
        match self.generation {
            Some(generation) => actions.push(SyncAction::Transmit {
                generation,
                request: ClientRequest::SendMessage {
                    conversation_id: conversation_id.clone(),
                    content: content.to_string(),
                    local_id: local_id.clone(),
                },
            }),
            None => {
                debug!(
                    conversation_id = %conversation_id,
                    local_id = %local_id,
                    "sync: transport down, sending over rest"
                );
                actions.push(SyncAction::PostMessage {
                    conversation_id: conversation_id.clone(),
                    local_id: local_id.clone(),
                    content: content.to_string(),
                });
            }
        }
    }

    fn fail_send(
        &mut self,
        local_id: &LocalId,
        conversation_id: ConversationId,
        actions: &mut Vec<SyncAction>,
    ) {
        if self.store.mark_failed(local_id) {
            actions.push(SyncAction::Emit(SyncEvent::DeliveryFailed {
                conversation_id: conversation_id.clone(),
                local_id: local_id.clone(),
            }));
            actions.push(SyncAction::Emit(SyncEvent::MessagesChanged { conversation_id }));
        }
    }

    fn on_message_received(
        &mut self,
        message: Message,
        local_id: Option<LocalId>,
        actions: &mut Vec<SyncAction>,
    ) {
        // Echoes of our own sends are never buffered.
        let echo = local_id
            .as_ref()
            .is_some_and(|local_id| self.tracks_send(local_id));
        let record = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(|| ConversationRecord::new(&self.identity.user_id));
        if let (false, Phase::Loading { buffered, .. }) = (echo, &mut record.phase) {
            debug!(
                conversation_id = %message.conversation_id,
                "sync: buffering live message until history resolves"
            );
            buffered.push((message, local_id));
            return;
        }
        self.ingest(message, local_id, actions);
    }

    /// Routes one confirmed message into the store, reconciling echoes of
    /// local sends and counting unread messages outside the focus.
    fn ingest(&mut self, message: Message, local_id: Option<LocalId>, actions: &mut Vec<SyncAction>) {
        let conversation_id = message.conversation_id.clone();
        if let Some(record) = self.conversations.get_mut(&conversation_id) {
            record.note_message(&message);
        }

        let echo = local_id.filter(|local_id| self.tracks_send(local_id));
        if let Some(local_id) = echo {
            let outcome = self.store.reconcile(&local_id, message);
            debug!(
                conversation_id = %conversation_id,
                local_id = %local_id,
                outcome = ?outcome,
                "sync: send reconciled"
            );
            self.settle_delivered(&conversation_id, local_id, actions);
            actions.push(SyncAction::Emit(SyncEvent::MessagesChanged { conversation_id }));
            return;
        }

        let focused = self.focused.as_ref() == Some(&conversation_id);
        let own = message.sender_id == self.identity.user_id;
        match self.store.append(message.clone()) {
            AppendOutcome::Duplicate => {
                debug!(conversation_id = %conversation_id, "sync: duplicate delivery ignored");
                return;
            }
            AppendOutcome::Superseded(local_id) => {
                self.settle_delivered(&conversation_id, local_id, actions);
            }
            AppendOutcome::Inserted => {
                if focused {
                    self.store
                        .mark_ids_read(&conversation_id, message.server_id().cloned());
                } else if !own && self.unread.on_inbound_message(&message, false) {
                    actions.push(SyncAction::Emit(SyncEvent::UnreadChanged {
                        total: self.unread.total(),
                    }));
                }
            }
        }
        actions.push(SyncAction::Emit(SyncEvent::MessagesChanged { conversation_id }));
    }

    fn tracks_send(&self, local_id: &LocalId) -> bool {
        self.outstanding.contains_key(local_id) || self.store.find_unconfirmed(local_id).is_some()
    }

    fn settle_delivered(
        &mut self,
        conversation_id: &ConversationId,
        local_id: LocalId,
        actions: &mut Vec<SyncAction>,
    ) {
        self.outstanding.remove(&local_id);
        actions.push(SyncAction::Emit(SyncEvent::Delivered {
            conversation_id: conversation_id.clone(),
            local_id,
        }));
    }

    fn mark_conversation_read(
        &mut self,
        conversation_id: &ConversationId,
        actions: &mut Vec<SyncAction>,
    ) {
        self.store.mark_read(conversation_id);
        let before = self.unread.total();
        self.unread
            .mark_read(&ReadTarget::Conversation(conversation_id.clone()));
        let total = self.unread.total();
        if total != before {
            actions.push(SyncAction::Emit(SyncEvent::UnreadChanged { total }));
        }
    }

    /// Recomputes unread counts from the message logs after a reconnect.
    fn reconcile_unread(&mut self, actions: &mut Vec<SyncAction>) {
        let conversation_ids: Vec<ConversationId> = self.store.conversation_ids().cloned().collect();
        let mut drifted = false;
        for conversation_id in conversation_ids {
            let tally = self
                .store
                .unread_tally(&conversation_id, &self.identity.user_id);
            drifted |= self.unread.reconcile_conversation(&conversation_id, tally);
        }
        if drifted {
            actions.push(SyncAction::Emit(SyncEvent::UnreadChanged {
                total: self.unread.total(),
            }));
        }
    }

    fn apply_membership(&mut self, membership: Vec<MembershipAction>, actions: &mut Vec<SyncAction>) {
        for action in membership {
            match action {
                MembershipAction::Join {
                    conversation_id,
                    generation,
                } => {
                    actions.push(SyncAction::Transmit {
                        generation,
                        request: ClientRequest::JoinRoom {
                            conversation_id: conversation_id.clone(),
                        },
                    });
                    actions.push(SyncAction::Emit(SyncEvent::JoinStateChanged {
                        conversation_id,
                        join_state: JoinState::Joining,
                    }));
                }
                MembershipAction::Leave {
                    conversation_id,
                    generation,
                } => actions.push(SyncAction::Transmit {
                    generation,
                    request: ClientRequest::LeaveRoom { conversation_id },
                }),
                MembershipAction::Joined {
                    conversation_id, ..
                } => actions.push(SyncAction::Emit(SyncEvent::JoinStateChanged {
                    conversation_id,
                    join_state: JoinState::Joined,
                })),
                MembershipAction::JoinFailed {
                    conversation_id,
                    reason,
                } => {
                    actions.push(SyncAction::Emit(SyncEvent::JoinStateChanged {
                        conversation_id: conversation_id.clone(),
                        join_state: JoinState::NotJoined,
                    }));
                    actions.push(SyncAction::Emit(SyncEvent::JoinFailed {
                        conversation_id,
                        reason,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
