use std::fmt;

use shared::domain::{User, UserId};
use tokio::sync::RwLock;

#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    pub subject_user_id: UserId,
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("subject_user_id", &self.subject_user_id)
            .finish()
    }
}

/// Credentials together with the identity they were issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSession {
    pub credentials: CredentialPair,
    pub user: User,
}

/// Holds the single live credential pair. Setting a new session replaces the
/// previous one outright.
#[derive(Default)]
pub struct CredentialStore {
    inner: RwLock<Option<AuthenticatedSession>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<AuthenticatedSession> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, session: AuthenticatedSession) {
        *self.inner.write().await = Some(session);
    }

    /// Swaps in renewed credentials for the current user. Returns false (and
    /// stores nothing) when the session was cleared or now belongs to a
    /// different subject.
    pub async fn replace_credentials(&self, credentials: CredentialPair) -> bool {
        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(session) if session.credentials.subject_user_id == credentials.subject_user_id => {
                session.credentials = credentials;
                true
            }
            _ => false,
        }
    }

    pub async fn clear(&self) -> Option<AuthenticatedSession> {
        self.inner.write().await.take()
    }

    /// Clears the session only if it still holds `refresh_token`, so a failed
    /// renewal cannot wipe out a session that replaced it in the meantime.
    pub async fn clear_if_refresh_token(&self, refresh_token: &str) -> bool {
        let mut guard = self.inner.write().await;
        let matches = guard
            .as_ref()
            .is_some_and(|session| session.credentials.refresh_token == refresh_token);
        if matches {
            *guard = None;
        }
        matches
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|session| session.credentials.access_token.clone())
    }

    pub async fn refresh_credential(&self) -> Option<(UserId, String)> {
        self.inner.read().await.as_ref().map(|session| {
            (
                session.credentials.subject_user_id.clone(),
                session.credentials.refresh_token.clone(),
            )
        })
    }

    pub async fn user(&self) -> Option<User> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|session| session.user.clone())
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
