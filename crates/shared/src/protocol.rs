use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, DeliveryState, LocalId, Message, MessageId, MessageKey, SubjectRef, UserId},
    error::ProtocolError,
};

const UNKNOWN_SENDER_NAME: &str = "Unknown";

/// Client → server real-time events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        local_id: LocalId,
    },
}

impl ClientRequest {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::JoinRoom { conversation_id }
            | Self::LeaveRoom { conversation_id }
            | Self::SendMessage {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::MalformedFrame(err.to_string()))
    }
}

/// Server → client real-time events, still in wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    RoomJoined {
        conversation_id: ConversationId,
    },
    MessageReceived {
        message: WireMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<LocalId>,
    },
    JoinError {
        conversation_id: ConversationId,
        #[serde(default)]
        reason: String,
    },
}

impl ServerEvent {
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|err| ProtocolError::MalformedFrame(err.to_string()))
    }
}

/// A user reference as the backend sends it: either a bare id or a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireUser {
    Id(String),
    Profile(WireProfile),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl WireUser {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Profile(profile) => &profile.id,
        }
    }

    fn display_name(&self) -> Option<String> {
        match self {
            Self::Id(_) => None,
            Self::Profile(profile) => profile
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .or_else(|| join_names(profile.first_name.as_deref(), profile.last_name.as_deref())),
        }
    }
}

/// Message payload as delivered over REST or the socket. Several historical
/// field spellings are accepted and folded together by [`Message::try_from`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "chatId", alias = "roomId")]
    pub conversation_id: String,
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<WireUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(alias = "text")]
    pub content: String,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

fn join_names(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.id.trim().is_empty() {
            return Err(ProtocolError::EmptyField {
                message_id: wire.id,
                field: "id",
            });
        }
        if wire.conversation_id.trim().is_empty() {
            return Err(ProtocolError::EmptyField {
                message_id: wire.id,
                field: "conversationId",
            });
        }

        let sender_id = wire
            .sender_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| wire.sender.as_ref().map(|sender| sender.id().to_string()))
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ProtocolError::MissingSender {
                message_id: wire.id.clone(),
            })?;

        let sender_name = wire
            .sender_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| wire.sender.as_ref().and_then(WireUser::display_name))
            .or_else(|| join_names(wire.first_name.as_deref(), wire.last_name.as_deref()))
            .unwrap_or_else(|| UNKNOWN_SENDER_NAME.to_string());

        Ok(Self {
            key: MessageKey::Server(MessageId(wire.id)),
            local_id: None,
            conversation_id: ConversationId(wire.conversation_id),
            sender_id: UserId(sender_id),
            sender_name,
            content: wire.content,
            created_at: wire.created_at,
            delivery: DeliveryState::Confirmed,
        })
    }
}

/// Inbox entry from `GET /conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(alias = "_id")]
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<WireUser>,
    #[serde(default, alias = "book", skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body of `POST /conversations/:id/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    pub content: String,
    pub local_id: LocalId,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
