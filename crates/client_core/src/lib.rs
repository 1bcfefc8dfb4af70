use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use shared::{
    domain::{ConversationId, User},
    protocol::RegisterRequest,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod durable_mirror;
pub mod error;
pub mod listeners;
pub mod mirror;
pub mod pipeline;
pub mod refresh;
pub mod sync;

pub use api::{conversation_display_name, ChatApi};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionNotice, ConnectionState};
pub use credentials::{AuthenticatedSession, CredentialPair, CredentialStore};
pub use durable_mirror::DurableOfflineMirror;
pub use error::{ClientError, ConnectionError};
pub use mirror::{MemoryMirror, MirrorKey, OfflineMirror};
pub use refresh::{HttpTokenRefresher, RefreshCoordinator, SessionSignal};
pub use sync::{ConversationState, ConversationSync, SyncEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Sync(SyncEvent),
    SessionStarted(User),
    SessionEnded,
    /// Credential renewal failed; the channel is down and the user must log in again.
    SessionExpired { reason: String },
}

/// One signed-in chat session: credentials, REST surface, realtime channel
/// and the synchronized conversation view, wired together.
pub struct ChatClient {
    settings: ClientSettings,
    credentials: Arc<CredentialStore>,
    api: Arc<ChatApi>,
    connection: ConnectionManager,
    sync: Arc<ConversationSync>,
    events: broadcast::Sender<ClientEvent>,
    _sync_worker: sync::SyncWorker,
    background: Vec<JoinHandle<()>>,
}

impl ChatClient {
    /// Builds the client and starts its background tasks; call from within a
    /// tokio runtime.
    pub fn new(settings: ClientSettings, mirror: Arc<dyn OfflineMirror>) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build HTTP client")?;

        let credentials = Arc::new(CredentialStore::new());
        let refresher = Arc::new(HttpTokenRefresher::new(
            http.clone(),
            settings.server_url.clone(),
        ));
        let refresh = Arc::new(RefreshCoordinator::new(credentials.clone(), refresher));
        let pipeline = Arc::new(pipeline::RequestPipeline::new(
            http,
            settings.server_url.clone(),
            credentials.clone(),
            refresh.clone(),
        ));
        let api = Arc::new(ChatApi::new(pipeline));
        let connection = ConnectionManager::new(ConnectionConfig::from_settings(&settings));
        let sync = ConversationSync::new(api.clone(), connection.clone(), mirror);
        let sync_worker = sync.attach();

        let (events, _) = broadcast::channel(1024);
        let background = vec![
            tokio::spawn(forward_sync_events(sync.subscribe(), events.clone())),
            tokio::spawn(watch_session(
                refresh.subscribe_signals(),
                connection.clone(),
                sync.clone(),
                events.clone(),
            )),
        ];

        Ok(Arc::new(Self {
            settings,
            credentials,
            api,
            connection,
            sync,
            events,
            _sync_worker: sync_worker,
            background,
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.credentials.user().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn snapshot(&self) -> ConversationState {
        self.sync.snapshot().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, ClientError> {
        let session = self.api.login(username, password).await?;
        self.start_session(session).await
    }

    pub async fn register(&self, form: &RegisterRequest) -> Result<User, ClientError> {
        let session = self.api.register(form).await?;
        self.start_session(session).await
    }

    /// Revokes the refresh credential (best-effort), closes the channel and
    /// forgets the session along with its mirrored data.
    pub async fn logout(&self) {
        if let Some(session) = self.credentials.get().await {
            if let Err(err) = self
                .api
                .logout(&session.user.id, &session.credentials.refresh_token)
                .await
            {
                warn!(error = %err, "logout request failed; clearing local session anyway");
            }
        }
        self.connection.disconnect().await;
        let ended = self.credentials.clear().await;
        self.sync.end_session().await;
        if let Some(session) = ended {
            self.sync.forget_mirror(&session.user.id).await;
            info!(user_id = %session.user.id, "session ended");
            let _ = self.events.send(ClientEvent::SessionEnded);
        }
    }

    pub async fn refresh_conversations(&self) -> Result<(), ClientError> {
        self.sync.refresh_conversations().await
    }

    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        self.sync.open_conversation(conversation_id).await
    }

    pub async fn close_conversation(&self) {
        self.sync.close_conversation().await
    }

    pub async fn send_message(&self, conversation_id: &ConversationId, body: &str) -> Result<(), ClientError> {
        self.sync.send_message(conversation_id, body).await
    }

    pub async fn find_user_by_phone(&self, phone: &str) -> Result<User, ClientError> {
        self.api.find_user_by_phone(phone).await
    }

    /// Looks the friend up by phone and starts a conversation with them.
    pub async fn start_conversation(&self, friend_phone: &str) -> Result<ConversationId, ClientError> {
        let friend = self.api.find_user_by_phone(friend_phone).await?;
        self.sync.create_conversation(&friend).await
    }

    async fn start_session(&self, session: AuthenticatedSession) -> Result<User, ClientError> {
        let user = session.user.clone();
        let access_token = session.credentials.access_token.clone();
        self.connection.disconnect().await;
        self.credentials.set(session).await;
        info!(user_id = %user.id, "session started");

        if let Err(err) = self.sync.begin_session(user.clone()).await {
            warn!(error = %err, "initial conversation fetch failed");
        }
        if let Err(err) = self.connection.connect(&access_token).await {
            warn!(error = %err, "realtime channel not open yet; retrying in the background");
        }
        let _ = self.events.send(ClientEvent::SessionStarted(user.clone()));
        Ok(user)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

async fn forward_sync_events(
    mut sync_events: broadcast::Receiver<SyncEvent>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match sync_events.recv().await {
            Ok(event) => {
                let _ = events.send(ClientEvent::Sync(event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "client event consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Reacts to credential renewal and expiry raised by the refresh coordinator.
async fn watch_session(
    mut signals: broadcast::Receiver<SessionSignal>,
    connection: ConnectionManager,
    sync: Arc<ConversationSync>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match signals.recv().await {
            Ok(SessionSignal::Renewed { access_token }) => {
                if !connection.update_token(&access_token).await {
                    continue;
                }
                if connection.state().await == ConnectionState::Disconnected {
                    info!("reopening realtime channel with renewed credential");
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        if let Err(err) = connection.connect(&access_token).await {
                            warn!(error = %err, "could not reopen realtime channel");
                        }
                    });
                }
            }
            Ok(SessionSignal::Expired { reason }) => {
                warn!(%reason, "session expired; tearing down");
                connection.disconnect().await;
                sync.end_session().await;
                let _ = events.send(ClientEvent::SessionExpired { reason });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session signals lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
