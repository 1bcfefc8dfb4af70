use shared::error::ApiError;
use thiserror::Error;

/// Failures of request/response calls and of credential renewal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("server unreachable: {0}")]
    TransportUnreachable(String),
    #[error("authorization expired: {0}")]
    AuthorizationExpired(String),
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
    #[error("could not encode request for {endpoint}: {reason}")]
    InvalidRequest { endpoint: String, reason: String },
    #[error("no authenticated session")]
    NotAuthenticated,
}

impl ClientError {
    pub fn is_refresh_failure(&self) -> bool {
        matches!(self, Self::RefreshFailed(_))
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        Self::TransportUnreachable(err.to_string())
    }
}

/// Failures of the realtime channel. Delivered to listeners rather than
/// returned, so it is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("realtime channel unreachable: {0}")]
    TransportUnreachable(String),
    #[error("realtime channel not connected; dropped {operation}")]
    ChannelNotReady { operation: &'static str },
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("malformed realtime payload: {0}")]
    MalformedPayload(String),
    #[error("a connect attempt is already in progress")]
    ConnectInProgress,
    #[error("connect attempt cancelled by disconnect")]
    Cancelled,
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
}
