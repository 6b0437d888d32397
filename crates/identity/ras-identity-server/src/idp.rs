//! HTTP client for the identity provider's token and backchannel endpoints.

use crate::config::ServerClientConfig;
use crate::error::{IdpError, OAuthErrorResponse, ServerClientError, ServerClientResult};
use crate::types::{
    BackchannelAuthorizeRequest, BackchannelAuthorizeResponse, CodeExchangeRequest,
    ConnectionTokenRequest, RefreshTokenRequest, TokenResponse,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CIBA: &str = "urn:openid:params:grant-type:ciba";
pub const GRANT_CONNECTION_TOKEN_EXCHANGE: &str =
    "urn:auth0:params:oauth:grant-type:token-exchange:federated-connection-access-token";
pub const SUBJECT_TOKEN_TYPE_REFRESH_TOKEN: &str = "urn:ietf:params:oauth:token-type:refresh_token";
pub const REQUESTED_TOKEN_TYPE_CONNECTION: &str =
    "http://auth0.com/oauth/token-type/federated-connection-access-token";

pub type IdpResult<T> = Result<T, IdpError>;

/// Calls the provider makes on behalf of the flows and the token cache
#[async_trait]
pub trait IdpClient: Send + Sync {
    async fn exchange_code(&self, request: CodeExchangeRequest) -> IdpResult<TokenResponse>;

    async fn refresh_token(&self, request: RefreshTokenRequest) -> IdpResult<TokenResponse>;

    async fn exchange_connection_token(
        &self,
        request: ConnectionTokenRequest,
    ) -> IdpResult<TokenResponse>;

    async fn backchannel_authorize(
        &self,
        request: BackchannelAuthorizeRequest,
    ) -> IdpResult<BackchannelAuthorizeResponse>;

    /// One poll of the token endpoint for a pending backchannel request
    async fn poll_backchannel(&self, auth_req_id: &str) -> IdpResult<TokenResponse>;
}

/// reqwest-based [`IdpClient`] using `client_secret_post` authentication
#[derive(Clone)]
pub struct HttpIdpClient {
    http_client: Client,
    config: Arc<ServerClientConfig>,
    token_endpoint: Url,
    backchannel_endpoint: Url,
}

impl HttpIdpClient {
    pub fn new(config: Arc<ServerClientConfig>) -> ServerClientResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| ServerClientError::Idp(e.into()))?;

        Ok(Self {
            http_client,
            token_endpoint: config.endpoint("oauth/token")?,
            backchannel_endpoint: config.endpoint("bc-authorize")?,
            config,
        })
    }

    fn form(&self, grant_type: Option<&str>) -> FormParams {
        let mut params = FormParams::new();
        params.push("client_id", &self.config.client_id);
        params.push("client_secret", &self.config.client_secret);
        if let Some(grant_type) = grant_type {
            params.push("grant_type", grant_type);
        }
        params
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        endpoint: &Url,
        params: &FormParams,
    ) -> IdpResult<T> {
        let response = self
            .http_client
            .post(endpoint.clone())
            .form(&params.0)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(provider_error) => {
                    debug!("Provider rejected request to {}: {}", endpoint, provider_error);
                    Err(IdpError::Provider(provider_error))
                }
                Err(_) => {
                    error!("Request to {} failed with status {}", endpoint, status);
                    Err(IdpError::InvalidResponse(format!(
                        "status {}: {}",
                        status, body
                    )))
                }
            };
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!("Unparseable response from {}: {}", endpoint, e);
            IdpError::InvalidResponse(e.to_string())
        })
    }
}

#[async_trait]
impl IdpClient for HttpIdpClient {
    async fn exchange_code(&self, request: CodeExchangeRequest) -> IdpResult<TokenResponse> {
        let mut params = self.form(Some(GRANT_AUTHORIZATION_CODE));
        params.push("code", request.code);
        params.push("code_verifier", request.code_verifier);
        params.push("redirect_uri", request.redirect_uri);

        self.post_form(&self.token_endpoint, &params).await
    }

    async fn refresh_token(&self, request: RefreshTokenRequest) -> IdpResult<TokenResponse> {
        let mut params = self.form(Some(GRANT_REFRESH_TOKEN));
        params.push("refresh_token", request.refresh_token);
        params.push_opt("audience", request.audience);
        params.push_opt("scope", request.scope);

        self.post_form(&self.token_endpoint, &params).await
    }

    async fn exchange_connection_token(
        &self,
        request: ConnectionTokenRequest,
    ) -> IdpResult<TokenResponse> {
        let mut params = self.form(Some(GRANT_CONNECTION_TOKEN_EXCHANGE));
        params.push("subject_token", request.refresh_token);
        params.push("subject_token_type", SUBJECT_TOKEN_TYPE_REFRESH_TOKEN);
        params.push("requested_token_type", REQUESTED_TOKEN_TYPE_CONNECTION);
        params.push("connection", request.connection);
        params.push_opt("login_hint", request.login_hint);

        self.post_form(&self.token_endpoint, &params).await
    }

    async fn backchannel_authorize(
        &self,
        request: BackchannelAuthorizeRequest,
    ) -> IdpResult<BackchannelAuthorizeResponse> {
        let mut params = self.form(None);
        for (key, value) in request.params {
            if !RESERVED_BACKCHANNEL_PARAMS.contains(&key.as_str()) {
                params.push(key, value);
            }
        }
        params.push("login_hint", request.login_hint);
        params.push("scope", request.scope);
        params.push_opt("binding_message", request.binding_message);
        if let Some(details) = request.authorization_details {
            params.push("authorization_details", details.to_string());
        }

        self.post_form(&self.backchannel_endpoint, &params).await
    }

    async fn poll_backchannel(&self, auth_req_id: &str) -> IdpResult<TokenResponse> {
        let mut params = self.form(Some(GRANT_CIBA));
        params.push("auth_req_id", auth_req_id);

        self.post_form(&self.token_endpoint, &params).await
    }
}

/// Set by the client itself; caller-supplied values are ignored
const RESERVED_BACKCHANNEL_PARAMS: &[&str] = &[
    "client_id",
    "client_secret",
    "login_hint",
    "scope",
    "binding_message",
    "authorization_details",
];

/// Ordered `application/x-www-form-urlencoded` body
#[derive(Debug, Default)]
struct FormParams(Vec<(String, String)>);

impl FormParams {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    fn push_opt(&mut self, key: &str, value: Option<String>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }
}
