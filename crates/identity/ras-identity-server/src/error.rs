//! Server client error types.

use ras_identity_store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type ServerClientResult<T> = Result<T, ServerClientError>;

/// Error body returned by the token and backchannel endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

impl OAuthErrorResponse {
    pub fn new(error: impl Into<String>, error_description: Option<&str>) -> Self {
        Self {
            error: error.into(),
            error_description: error_description.map(String::from),
        }
    }
}

impl fmt::Display for OAuthErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Failure talking to the identity provider
#[derive(Debug, Clone, Error)]
pub enum IdpError {
    #[error("Provider error: {0}")]
    Provider(OAuthErrorResponse),

    #[error("HTTP request failed: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for IdpError {
    fn from(err: reqwest::Error) -> Self {
        IdpError::Http(Arc::new(err))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ServerClientError {
    #[error("Missing required argument: {0}")]
    MissingRequiredArgument(&'static str),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("The login transaction is missing, expired or was already used")]
    InvalidState,

    #[error("Authorization failed: {0}")]
    AuthorizationError(OAuthErrorResponse),

    #[error(
        "A refresh token was not found but is required to be able to retrieve an access token"
    )]
    MissingRefreshToken,

    #[error("Refreshing the access token failed: {0}")]
    RefreshFailed(OAuthErrorResponse),

    #[error("Backchannel authentication was denied: {0}")]
    BackchannelDenied(OAuthErrorResponse),

    #[error("Backchannel authentication request expired")]
    BackchannelExpired,

    #[error("Backchannel authentication failed: {0}")]
    BackchannelFailed(OAuthErrorResponse),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("{0}")]
    StartLinkUser(String),

    #[error("Backchannel logout failed: {0}")]
    BackchannelLogout(String),

    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    #[error("Identity provider request failed: {0}")]
    Idp(IdpError),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    SerializationError(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for ServerClientError {
    fn from(err: serde_json::Error) -> Self {
        ServerClientError::SerializationError(Arc::new(err))
    }
}

impl From<config::ConfigError> for ServerClientError {
    fn from(err: config::ConfigError) -> Self {
        ServerClientError::ConfigError(err.to_string())
    }
}

impl ServerClientError {
    /// Transport failures pass through; provider rejections map through `on_provider`
    pub(crate) fn from_idp(
        err: IdpError,
        on_provider: impl FnOnce(OAuthErrorResponse) -> ServerClientError,
    ) -> Self {
        match err {
            IdpError::Provider(response) => on_provider(response),
            other => ServerClientError::Idp(other),
        }
    }
}
