use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{ApiEnvelope, EnvelopeStatus},
};
use tracing::{debug, warn};

use crate::{credentials::CredentialStore, error::ClientError, refresh::RefreshCoordinator};

/// Authenticated request/response calls. A 401 on a request that carried a
/// credential triggers one shared renewal and exactly one retry.
pub struct RequestPipeline {
    http: Client,
    server_url: String,
    credentials: Arc<CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
}

impl RequestPipeline {
    pub fn new(
        http: Client,
        server_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
        refresh: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            credentials,
            refresh,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ClientError> {
        self.request(Method::GET, endpoint, None).await
    }

    pub async fn post<T, B>(&self, endpoint: &str, body: &B) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(endpoint, body)?;
        self.request(Method::POST, endpoint, Some(body)).await
    }

    /// Sends without a credential; used for login and registration.
    pub async fn post_anonymous<T, B>(&self, endpoint: &str, body: &B) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = encode_body(endpoint, body)?;
        let response = self.send(Method::POST, endpoint, Some(&body), None).await?;
        decode_envelope(endpoint, response).await
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        let token = self.credentials.access_token().await;
        let response = self
            .send(method.clone(), endpoint, body.as_ref(), token.as_deref())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return decode_envelope(endpoint, response).await;
        }
        let Some(rejected) = token else {
            return decode_envelope(endpoint, response).await;
        };

        debug!(endpoint, "access credential rejected; renewing before retry");
        let fresh = self.refresh.ensure_fresh_credential(&rejected).await?;
        let retried = self
            .send(method, endpoint, body.as_ref(), Some(&fresh))
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(endpoint, "renewed credential rejected as well");
        }
        decode_envelope(endpoint, retried).await
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Response, ClientError> {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.server_url, endpoint));
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.send().await.map_err(ClientError::from_transport)
    }
}

fn encode_body<B: Serialize + ?Sized>(endpoint: &str, body: &B) -> Result<Value, ClientError> {
    serde_json::to_value(body).map_err(|err| ClientError::InvalidRequest {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    })
}

/// Unwraps the server envelope. Non-2xx statuses and `fail` envelopes become
/// [`ClientError::Api`] with the server's message; 401 becomes
/// [`ClientError::AuthorizationExpired`].
pub(crate) async fn decode_envelope<T: DeserializeOwned>(
    endpoint: &str,
    response: Response,
) -> Result<T, ClientError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(ClientError::from_transport)?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ApiEnvelope<Value>>(&bytes)
            .ok()
            .map(|envelope| envelope.message)
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::AuthorizationExpired(message));
        }
        return Err(ApiError::new(status.as_u16(), message).into());
    }

    let invalid = |reason: String| ClientError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason,
    };
    let envelope: ApiEnvelope<T> =
        serde_json::from_slice(&bytes).map_err(|err| invalid(err.to_string()))?;
    if envelope.status == EnvelopeStatus::Fail {
        return Err(ApiError::new(status.as_u16(), envelope.message).into());
    }
    match envelope.data {
        Some(data) => Ok(data),
        // Unit-like payloads (logout) legitimately carry `data: null`.
        None => serde_json::from_value(Value::Null)
            .map_err(|_| invalid("response carried no data".into())),
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
