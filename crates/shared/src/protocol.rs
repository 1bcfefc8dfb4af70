use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, Message, UserId};

/// Close code reserved for an intentional disconnect; any other code means the
/// channel should be re-established.
pub const INTENTIONAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JoinConversation,
    JoinSuccess,
    NewMessage,
    MessageReceived,
    UserOnline,
    UserOffline,
    NewConversation,
}

/// Normalized realtime event. Every tag carries the same four fields; the ones
/// a tag does not use are empty or zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default, alias = "messeage")]
    pub message: String,
    #[serde(default)]
    pub created_at: i64,
}

impl RealtimeEvent {
    pub fn join_conversation(
        conversation_id: ConversationId,
        user_id: UserId,
        created_at: i64,
    ) -> Self {
        Self {
            kind: EventKind::JoinConversation,
            conversation_id,
            sender_id: user_id,
            message: String::new(),
            created_at,
        }
    }

    pub fn new_message(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            kind: EventKind::NewMessage,
            conversation_id,
            sender_id,
            message: body.into(),
            created_at,
        }
    }

    /// Wraps counterparty text that was not structured at all.
    pub fn raw_text(body: impl Into<String>, created_at: i64) -> Self {
        Self {
            kind: EventKind::MessageReceived,
            conversation_id: ConversationId::default(),
            sender_id: UserId::default(),
            message: body.into(),
            created_at,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.sender_id.clone(), self.message.clone(), self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Fail,
}

/// Every REST response body is wrapped in this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub phone: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUserPayload {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user: AuthUserPayload,
    pub token: TokenPayload,
}

/// Body of both `/auth/refresh` and `/auth/logout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummaryPayload {
    pub conversation_id: String,
    #[serde(default)]
    pub participant: Option<Vec<ParticipantPayload>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationListPayload {
    #[serde(default)]
    pub conversation_list: Option<Vec<ConversationSummaryPayload>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub sender_id: String,
    #[serde(alias = "messeage")]
    pub message: String,
    pub created_at: i64,
}

impl From<MessagePayload> for Message {
    fn from(value: MessagePayload) -> Self {
        Message::new(UserId(value.sender_id), value.message, value.created_at)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageListPayload {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default, alias = "messeages")]
    pub messages: Option<Vec<MessagePayload>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessagePayload {
    #[serde(alias = "messeage")]
    pub message: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub friend_phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedConversationPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindUserByPhoneRequest {
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundUserPayload {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}
