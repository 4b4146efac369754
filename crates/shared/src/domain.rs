use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display name attached to admin/system messages.
pub const SYSTEM_SENDER: &str = "System";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(MessageId);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelUrl(pub String);

impl ChannelUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message as the client sees it. Identity is `(channel_url, id)`;
/// every other field is display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel_url: ChannelUrl,
    pub id: MessageId,
    pub text: String,
    pub sender: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub url: ChannelUrl,
    pub name: String,
    pub member_count: u32,
    pub unread_message_count: u32,
    pub last_message: String,
}

/// Who the session runs as. Resolved at the preference-store boundary and
/// passed explicitly into session start; sync logic never reads ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub nickname: String,
}
