use std::sync::Arc;

use futures::future::join_all;
use shared::{
    domain::{sort_chronologically, Conversation, ConversationId, Message, User, UserId},
    protocol::{
        AuthPayload, ConversationListPayload, ConversationSummaryPayload, CreateConversationRequest,
        CreatedConversationPayload, FindUserByPhoneRequest, FoundUserPayload, LoginRequest,
        MessageListPayload, RefreshRequest, RegisterRequest, SendMessageRequest,
        SentMessagePayload,
    },
};
use tracing::{debug, warn};

use crate::{
    credentials::{AuthenticatedSession, CredentialPair},
    error::ClientError,
    pipeline::RequestPipeline,
};

pub mod endpoints {
    use shared::domain::ConversationId;

    pub const LOGIN: &str = "/auth/login";
    pub const REGISTER: &str = "/auth/register";
    pub const REFRESH: &str = "/auth/refresh";
    pub const LOGOUT: &str = "/auth/logout";
    pub const CONVERSATIONS: &str = "/user/conversation";
    pub const FIND_BY_PHONE: &str = "/user/find-by-phone";
    pub const CONVERSATION: &str = "/chat/conversation";
    pub const SEND: &str = "/chat/send";

    pub fn conversation(id: &ConversationId) -> String {
        format!("{CONVERSATION}/{id}")
    }
}

const UNKNOWN_CONVERSATION_NAME: &str = "Unknown";

/// Typed wrappers over the REST surface.
pub struct ChatApi {
    pipeline: Arc<RequestPipeline>,
}

impl ChatApi {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedSession, ClientError> {
        let payload: AuthPayload = self
            .pipeline
            .post_anonymous(
                endpoints::LOGIN,
                &LoginRequest {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        Ok(session_from(payload, username, None))
    }

    pub async fn register(
        &self,
        form: &RegisterRequest,
    ) -> Result<AuthenticatedSession, ClientError> {
        let payload: AuthPayload = self
            .pipeline
            .post_anonymous(endpoints::REGISTER, form)
            .await?;
        Ok(session_from(
            payload,
            &form.username,
            Some(form.phone.clone()),
        ))
    }

    /// Revokes the refresh credential server-side.
    pub async fn logout(&self, user_id: &UserId, refresh_token: &str) -> Result<(), ClientError> {
        self.pipeline
            .post_anonymous(
                endpoints::LOGOUT,
                &RefreshRequest {
                    user_id: user_id.to_string(),
                    refresh_token: refresh_token.to_string(),
                },
            )
            .await
    }

    /// Lists the user's conversations, each enriched with its newest message.
    /// A conversation whose history cannot be fetched is still listed, just
    /// without a last message.
    pub async fn list_conversations(
        &self,
        local_user: &UserId,
    ) -> Result<Vec<Conversation>, ClientError> {
        let payload: ConversationListPayload = self.pipeline.get(endpoints::CONVERSATIONS).await?;
        let summaries = payload.conversation_list.unwrap_or_default();
        debug!(count = summaries.len(), "fetched conversation list");

        let enriched = summaries.into_iter().map(|summary| async move {
            let id = ConversationId::new(summary.conversation_id.clone());
            let last_message = match self.get_messages(&id).await {
                Ok(messages) => messages.into_iter().last(),
                Err(err) => {
                    warn!(conversation_id = %id, error = %err, "could not fetch history for conversation");
                    None
                }
            };
            conversation_from(summary, local_user, last_message)
        });
        Ok(join_all(enriched).await)
    }

    /// History of one conversation, oldest first.
    pub async fn get_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ClientError> {
        let payload: MessageListPayload = self
            .pipeline
            .get(&endpoints::conversation(conversation_id))
            .await?;
        let mut messages: Vec<Message> = payload
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(Message::from)
            .collect();
        sort_chronologically(&mut messages);
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        body: &str,
    ) -> Result<SentMessagePayload, ClientError> {
        self.pipeline
            .post(
                endpoints::SEND,
                &SendMessageRequest {
                    conversation_id: conversation_id.to_string(),
                    message: body.to_string(),
                },
            )
            .await
    }

    pub async fn create_conversation(
        &self,
        friend_phone: &str,
    ) -> Result<ConversationId, ClientError> {
        let payload: CreatedConversationPayload = self
            .pipeline
            .post(
                endpoints::CONVERSATION,
                &CreateConversationRequest {
                    friend_phone: friend_phone.to_string(),
                },
            )
            .await?;
        Ok(ConversationId::new(payload.conversation_id))
    }

    /// The server returns no user id for this lookup; the phone number stands
    /// in for it and the e-mail local part for the username.
    pub async fn find_user_by_phone(&self, phone: &str) -> Result<User, ClientError> {
        let found: FoundUserPayload = self
            .pipeline
            .post(
                endpoints::FIND_BY_PHONE,
                &FindUserByPhoneRequest {
                    phone: phone.to_string(),
                },
            )
            .await?;
        let username = found
            .email
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        let phone = if found.phone.is_empty() {
            phone.to_string()
        } else {
            found.phone
        };
        Ok(User {
            id: UserId::new(phone.clone()),
            display_name: found.name,
            username,
            phone: Some(phone),
        })
    }
}

fn session_from(payload: AuthPayload, username: &str, phone: Option<String>) -> AuthenticatedSession {
    let user_id = UserId::new(payload.user.user_id);
    AuthenticatedSession {
        credentials: CredentialPair {
            access_token: payload.token.access_token,
            refresh_token: payload.token.refresh_token,
            subject_user_id: user_id.clone(),
        },
        user: User {
            id: user_id,
            display_name: payload.user.name,
            username: username.to_string(),
            phone,
        },
    }
}

fn conversation_from(
    summary: ConversationSummaryPayload,
    local_user: &UserId,
    last_message: Option<Message>,
) -> Conversation {
    let participants: Vec<User> = summary
        .participant
        .unwrap_or_default()
        .into_iter()
        .map(|participant| User {
            id: UserId::new(participant.id),
            display_name: participant.name.clone(),
            username: participant.name,
            phone: None,
        })
        .collect();
    Conversation {
        id: ConversationId::new(summary.conversation_id),
        display_name: conversation_display_name(&participants, local_user),
        participants,
        last_message,
    }
}

/// The first participant that is not the local user, else the first
/// participant, else a placeholder.
pub fn conversation_display_name(participants: &[User], local_user: &UserId) -> String {
    participants
        .iter()
        .find(|user| &user.id != local_user)
        .or_else(|| participants.first())
        .map(|user| user.display_name.clone())
        .unwrap_or_else(|| UNKNOWN_CONVERSATION_NAME.to_string())
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
