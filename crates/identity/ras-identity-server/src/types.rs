//! Protocol types and per-call options.

use crate::config::AuthorizationParams;
use ras_identity_store::{AppState, CacheKey, CachedToken, SessionRecord, UserClaims};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth2 token response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Providers omitting `expires_in` get a conservative one hour
    pub fn to_cached_token(&self) -> CachedToken {
        CachedToken::new(
            self.access_token.clone(),
            self.token_type.clone(),
            self.expires_in.unwrap_or(3600),
        )
    }
}

/// Response of the backchannel authorization endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackchannelAuthorizeResponse {
    pub auth_req_id: String,
    pub expires_in: u64,
    pub interval: Option<u64>,
}

/// Code exchange parameters sent to the token endpoint
#[derive(Debug, Clone)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
    pub audience: Option<String>,
    pub scope: Option<String>,
}

/// Federated connection token exchange parameters
#[derive(Debug, Clone)]
pub struct ConnectionTokenRequest {
    pub refresh_token: String,
    pub connection: String,
    pub login_hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackchannelAuthorizeRequest {
    /// JSON encoded `iss_sub` login hint
    pub login_hint: String,
    pub scope: String,
    pub binding_message: Option<String>,
    pub authorization_details: Option<serde_json::Value>,
    pub params: AuthorizationParams,
}

/// Identifies the user a backchannel request is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginHint {
    pub sub: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartLoginOptions {
    pub authorization_params: AuthorizationParams,
    pub app_state: Option<AppState>,
}

impl StartLoginOptions {
    pub fn with_app_state(mut self, app_state: AppState) -> Self {
        self.app_state = Some(app_state);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.authorization_params.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StartLinkUserOptions {
    pub connection: String,
    pub connection_scope: Option<String>,
    pub authorization_params: AuthorizationParams,
    pub app_state: Option<AppState>,
}

impl StartLinkUserOptions {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            connection_scope: None,
            authorization_params: AuthorizationParams::new(),
            app_state: None,
        }
    }

    pub fn with_app_state(mut self, app_state: AppState) -> Self {
        self.app_state = Some(app_state);
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoginBackchannelOptions {
    pub login_hint: LoginHint,
    pub binding_message: Option<String>,
    pub authorization_params: AuthorizationParams,
    /// Rich Authorization Request payload, forwarded verbatim
    pub authorization_details: Option<serde_json::Value>,
}

impl LoginBackchannelOptions {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            login_hint: LoginHint { sub: sub.into() },
            binding_message: None,
            authorization_params: AuthorizationParams::new(),
            authorization_details: None,
        }
    }

    pub fn with_binding_message(mut self, message: impl Into<String>) -> Self {
        self.binding_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessTokenOptions {
    pub audience: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionTokenOptions {
    pub connection: String,
    pub login_hint: Option<String>,
}

impl ConnectionTokenOptions {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            login_hint: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    pub return_to: Option<String>,
}

/// Outcome of a completed interactive login
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub session: SessionRecord,
    pub app_state: Option<AppState>,
}

#[derive(Debug, Clone)]
pub struct LinkResult {
    pub app_state: Option<AppState>,
}

/// Session as exposed to integrators; store-internal bookkeeping is omitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionData {
    pub user: UserClaims,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub token_cache: HashMap<String, CachedToken>,
}

impl From<SessionRecord> for SessionData {
    fn from(record: SessionRecord) -> Self {
        let token_cache = record
            .token_cache
            .into_iter()
            .map(|(key, token)| (describe_key(&key), token))
            .collect();

        Self {
            user: record.user,
            id_token: record.id_token,
            refresh_token: record.refresh_token,
            token_cache,
        }
    }
}

fn describe_key(key: &CacheKey) -> String {
    match &key.connection {
        Some(connection) => format!("connection:{}", connection),
        None => format!("{}|{}", key.audience, key.scope_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_defaults() {
        let json = r#"{"access_token": "at", "expires_in": 120}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert!(response.refresh_token.is_none());

        let cached = response.to_cached_token();
        assert_eq!(cached.access_token, "at");
        assert!(cached.is_fresh(chrono::Duration::seconds(60)));
        assert!(!cached.is_fresh(chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_session_data_hides_internal_state() {
        let mut record = SessionRecord::new(
            "s1".to_string(),
            UserClaims::new("auth0|1"),
            "id-token".to_string(),
            None,
            Some("sid-1".to_string()),
        );
        record.insert_token(
            CacheKey::new("https://api", "openid"),
            CachedToken::new("a".to_string(), "Bearer".to_string(), 60),
        );
        record.insert_token(
            CacheKey::for_connection("github"),
            CachedToken::new("b".to_string(), "Bearer".to_string(), 60),
        );

        let data = SessionData::from(record);
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("internal").is_none());
        assert_eq!(json["user"]["sub"], "auth0|1");
        assert!(data.token_cache.contains_key("https://api|openid"));
        assert!(data.token_cache.contains_key("connection:github"));
    }
}
