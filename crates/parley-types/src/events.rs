use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{Message, MessageId, MessageStatus, Presence, UserId};

/// Commands sent FROM client TO server over WebSocket.
///
/// Ids may arrive as JSON numbers or numeric strings; older clients render
/// them straight out of templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Bind this connection to a user
    IdentifyUser {
        #[serde(deserialize_with = "flexible_id")]
        user_id: UserId,
    },

    /// Post a message to the other participant
    SendMessage {
        #[serde(default)]
        message: Option<String>,
        #[serde(default, deserialize_with = "flexible_opt_id")]
        sender_id: Option<UserId>,
        #[serde(deserialize_with = "flexible_id")]
        receiver_id: UserId,
        #[serde(default)]
        attachment: Option<String>,
    },

    /// The receiver has the conversation open: bind, go online, mark delivered
    ReceiverConnected {
        #[serde(deserialize_with = "flexible_id")]
        receiver_id: UserId,
    },

    /// Mark everything from `other_user_id` to `reader_id` as read
    MarkRead {
        #[serde(deserialize_with = "flexible_id")]
        reader_id: UserId,
        #[serde(deserialize_with = "flexible_id")]
        other_user_id: UserId,
    },

    /// Periodic liveness signal
    Heartbeat {
        #[serde(deserialize_with = "flexible_id")]
        user_id: UserId,
    },

    /// Redact a message for everyone, or hide it from the receiver
    DeleteMessage {
        #[serde(deserialize_with = "flexible_id")]
        msg_id: MessageId,
        #[serde(default)]
        for_everyone: bool,
    },

    /// Ask for the current presence of a user (answered to this connection only)
    GetPresence {
        #[serde(deserialize_with = "flexible_id")]
        user_id: UserId,
    },
}

impl ClientCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::IdentifyUser { .. } => "identify_user",
            Self::SendMessage { .. } => "send_message",
            Self::ReceiverConnected { .. } => "receiver_connected",
            Self::MarkRead { .. } => "mark_read",
            Self::Heartbeat { .. } => "heartbeat",
            Self::DeleteMessage { .. } => "delete_message",
            Self::GetPresence { .. } => "get_presence",
        }
    }
}

/// Events sent FROM server TO clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted; carries the server-assigned id and timestamp
    ChatMessage {
        msg_id: MessageId,
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<String>,
        sender_id: UserId,
        receiver_id: UserId,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    },

    /// A batch of messages advanced to `new_status`
    StatusUpdate {
        msg_ids: Vec<MessageId>,
        new_status: MessageStatus,
    },

    /// A user came online, went offline, or was queried
    PresenceUpdate {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    /// A message was redacted or hidden from its receiver
    DeleteMessage { msg_id: MessageId, for_everyone: bool },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::StatusUpdate { .. } => "status_update",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::DeleteMessage { .. } => "delete_message",
        }
    }
}

impl From<&Message> for ServerEvent {
    fn from(msg: &Message) -> Self {
        Self::ChatMessage {
            msg_id: msg.id,
            message: msg.content.clone(),
            attachment: msg.attachment.clone(),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            timestamp: msg.created_at,
            status: msg.status,
        }
    }
}

impl From<&Presence> for ServerEvent {
    fn from(p: &Presence) -> Self {
        Self::PresenceUpdate {
            user_id: p.user_id,
            is_online: p.online,
            last_seen: p.last_seen,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(i64),
    Text(String),
}

impl RawId {
    fn into_id<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Self::Num(n) => Ok(n),
            Self::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid id: {:?}", s))),
        }
    }
}

fn flexible_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer)?.into_id()
}

fn flexible_opt_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_id)
        .transpose()
}
