use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Two deliveries of the same message may be stamped up to this many seconds apart.
pub const DEDUP_WINDOW_SECS: i64 = 2;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: UserId,
    pub body: String,
    pub created_at: i64,
}

impl Message {
    pub fn new(sender_id: UserId, body: impl Into<String>, created_at: i64) -> Self {
        Self {
            sender_id,
            body: body.into(),
            created_at,
        }
    }

    /// Whether `other` is another delivery of this message: same sender and body,
    /// stamped within [`DEDUP_WINDOW_SECS`]. The wire carries no message id.
    pub fn is_same_delivery(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.body == other.body
            && self.created_at.abs_diff(other.created_at) <= DEDUP_WINDOW_SECS.unsigned_abs()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<User>,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

impl Conversation {
    pub fn last_activity(&self) -> Option<i64> {
        self.last_message.as_ref().map(|message| message.created_at)
    }
}

/// Newest activity first; conversations without a last message go last.
/// The sort is stable so equal timestamps keep their current order.
pub fn sort_by_recent_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| match (a.last_activity(), b.last_activity()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Orders a message history by creation time, arrival order breaking ties.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by_key(|message| message.created_at);
}
