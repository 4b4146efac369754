//! Wire types for the chat backend. Payloads are tagged by a string type
//! discriminator; decoding into domain values happens exactly once, at the
//! gateway boundary, and nothing past that boundary inspects tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, ChannelUrl, Message, MessageId, SYSTEM_SENDER};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub user_id: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub user_id: String,
    pub limit: u32,
    pub anchor_ms: i64,
}

/// A message as the backend stores it. Unknown message types deserialize to
/// `Unsupported` so a backend rollout of a new type never breaks the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageRecord {
    User {
        message_id: i64,
        channel_url: String,
        text: String,
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_nickname: Option<String>,
        created_at: DateTime<Utc>,
    },
    Admin {
        message_id: i64,
        channel_url: String,
        text: String,
        created_at: DateTime<Utc>,
    },
    #[serde(other)]
    Unsupported,
}

impl MessageRecord {
    /// Normalizes a wire record into a domain message. User messages take the
    /// sender's nickname, falling back to the raw user id; admin messages get
    /// the reserved system sender. Unsupported records normalize to nothing.
    pub fn into_message(self) -> Option<Message> {
        match self {
            MessageRecord::User {
                message_id,
                channel_url,
                text,
                sender_id,
                sender_nickname,
                created_at,
            } => Some(Message {
                channel_url: ChannelUrl(channel_url),
                id: MessageId(message_id),
                text,
                sender: sender_nickname
                    .filter(|nickname| !nickname.is_empty())
                    .unwrap_or(sender_id),
                sent_at: created_at,
            }),
            MessageRecord::Admin {
                message_id,
                channel_url,
                text,
                created_at,
            } => Some(Message {
                channel_url: ChannelUrl(channel_url),
                id: MessageId(message_id),
                text,
                sender: SYSTEM_SENDER.to_string(),
                sent_at: created_at,
            }),
            MessageRecord::Unsupported => None,
        }
    }

    fn display_text(&self) -> &str {
        match self {
            MessageRecord::User { text, .. } | MessageRecord::Admin { text, .. } => text,
            MessageRecord::Unsupported => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_url: String,
    pub name: String,
    pub member_count: u32,
    pub unread_message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageRecord>,
}

impl ChannelRecord {
    pub fn into_channel(self) -> Channel {
        let last_message = self
            .last_message
            .as_ref()
            .map(|record| record.display_text().to_string())
            .unwrap_or_default();
        Channel {
            url: ChannelUrl(self.channel_url),
            name: self.name,
            member_count: self.member_count,
            unread_message_count: self.unread_message_count,
            last_message,
        }
    }
}

/// One frame on the real-time push stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushFrame {
    MessageReceived { message: MessageRecord },
    MessageUpdated { message: MessageRecord },
    MessageDeleted { channel_url: String, message_id: i64 },
    ChannelChanged { channel: ChannelRecord },
    #[serde(other)]
    Unsupported,
}
