use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::UserId,
    protocol::{AuthPayload, RefreshRequest},
};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::endpoints,
    credentials::{CredentialPair, CredentialStore},
    error::ClientError,
    pipeline::decode_envelope,
};

type RefreshOutcome = Result<String, ClientError>;

/// Exchanges a refresh credential for a new pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        user_id: &UserId,
        refresh_token: &str,
    ) -> Result<CredentialPair, ClientError>;
}

/// Calls `/auth/refresh` directly, outside the request pipeline, so renewal
/// can never recurse into another renewal.
pub struct HttpTokenRefresher {
    http: Client,
    server_url: String,
}

impl HttpTokenRefresher {
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(
        &self,
        user_id: &UserId,
        refresh_token: &str,
    ) -> Result<CredentialPair, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.server_url, endpoints::REFRESH))
            .json(&RefreshRequest {
                user_id: user_id.to_string(),
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        let payload: AuthPayload = decode_envelope(endpoints::REFRESH, response).await?;
        Ok(CredentialPair {
            access_token: payload.token.access_token,
            refresh_token: payload.token.refresh_token,
            subject_user_id: user_id.clone(),
        })
    }
}

/// Session-wide notifications raised by credential handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// A new access credential is in the store.
    Renewed { access_token: String },
    /// Renewal failed; credentials are gone and the session must re-authenticate.
    Expired { reason: String },
}

enum RefreshState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

struct RefreshFailure {
    error: ClientError,
    teardown: bool,
}

/// Single-flight credential renewal. Whoever finds the coordinator idle starts
/// a renewal; everyone arriving while it runs waits for the same outcome.
/// The renewal runs on its own task so a cancelled caller never strands the
/// others.
pub struct RefreshCoordinator {
    credentials: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    state: Arc<Mutex<RefreshState>>,
    signals: broadcast::Sender<SessionSignal>,
}

impl RefreshCoordinator {
    pub fn new(credentials: Arc<CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            credentials,
            refresher,
            state: Arc::new(Mutex::new(RefreshState::Idle)),
            signals,
        }
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Returns an access credential newer than `rejected_token`, renewing it
    /// if nobody else already has.
    pub async fn ensure_fresh_credential(&self, rejected_token: &str) -> RefreshOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "credential refresh in flight; waiting");
                }
                RefreshState::Idle => {
                    if let Some(current) = self.credentials.access_token().await {
                        if current != rejected_token {
                            debug!("credential already renewed by an earlier refresh");
                            return Ok(current);
                        }
                    }
                    *state = RefreshState::Refreshing { waiters: vec![tx] };
                    self.spawn_refresh();
                }
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(ClientError::RefreshFailed(
                "refresh task ended without reporting an outcome".into(),
            ))
        })
    }

    fn spawn_refresh(&self) {
        let credentials = Arc::clone(&self.credentials);
        let refresher = Arc::clone(&self.refresher);
        let state = Arc::clone(&self.state);
        let signals = self.signals.clone();

        tokio::spawn(async move {
            let outcome = match run_refresh(&credentials, refresher.as_ref()).await {
                Ok(access_token) => {
                    let _ = signals.send(SessionSignal::Renewed {
                        access_token: access_token.clone(),
                    });
                    Ok(access_token)
                }
                Err(failure) => {
                    if failure.teardown {
                        warn!(error = %failure.error, "credential refresh failed; ending session");
                        let _ = signals.send(SessionSignal::Expired {
                            reason: failure.error.to_string(),
                        });
                    } else {
                        warn!(error = %failure.error, "credential refresh abandoned");
                    }
                    Err(failure.error)
                }
            };

            let waiters = {
                let mut guard = state.lock().await;
                match std::mem::replace(&mut *guard, RefreshState::Idle) {
                    RefreshState::Refreshing { waiters } => waiters,
                    RefreshState::Idle => Vec::new(),
                }
            };
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        });
    }
}

async fn run_refresh(
    credentials: &CredentialStore,
    refresher: &dyn TokenRefresher,
) -> Result<String, RefreshFailure> {
    let Some((user_id, refresh_token)) = credentials.refresh_credential().await else {
        return Err(RefreshFailure {
            error: ClientError::RefreshFailed("no refresh credential available".into()),
            teardown: true,
        });
    };

    info!(%user_id, "refreshing access credential");
    let renewed = match refresher.refresh(&user_id, &refresh_token).await {
        Ok(renewed) => renewed,
        Err(err) => {
            // A newer login may already hold the store; only its own session is torn down.
            let teardown = credentials.clear_if_refresh_token(&refresh_token).await;
            let error = match err {
                ClientError::RefreshFailed(reason) => ClientError::RefreshFailed(reason),
                other => ClientError::RefreshFailed(other.to_string()),
            };
            return Err(RefreshFailure { error, teardown });
        }
    };

    let access_token = renewed.access_token.clone();
    if !credentials.replace_credentials(renewed).await {
        return Err(RefreshFailure {
            error: ClientError::RefreshFailed("session changed while refreshing".into()),
            teardown: false,
        });
    }
    info!(%user_id, "access credential renewed");
    Ok(access_token)
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
