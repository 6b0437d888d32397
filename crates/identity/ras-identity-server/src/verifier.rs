//! ID token and logout token verification.

use crate::config::ServerClientConfig;
use crate::error::{ServerClientError, ServerClientResult};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use ras_identity_store::{LogoutClaims, UserClaims};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Protocol claims that are not copied into the stored user profile
const PROTOCOL_CLAIMS: &[&str] = &[
    "iss", "aud", "exp", "iat", "nbf", "jti", "azp", "auth_time", "at_hash", "c_hash",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    pub sid: Option<String>,
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub claims: HashMap<String, serde_json::Value>,
}

impl IdTokenClaims {
    pub fn user_claims(&self) -> ServerClientResult<UserClaims> {
        let mut profile: serde_json::Map<String, serde_json::Value> = self
            .claims
            .iter()
            .filter(|(name, _)| !PROTOCOL_CLAIMS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        profile.insert("sub".to_string(), serde_json::Value::String(self.sub.clone()));

        Ok(serde_json::from_value(serde_json::Value::Object(profile))?)
    }
}

#[derive(Debug, Deserialize)]
struct LogoutTokenClaims {
    sub: Option<String>,
    sid: Option<String>,
    nonce: Option<String>,
    events: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Verifies tokens minted by the identity provider
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> ServerClientResult<IdTokenClaims>;

    async fn verify_logout_token(&self, logout_token: &str) -> ServerClientResult<LogoutClaims>;
}

/// [`TokenVerifier`] checking signature, issuer, audience and expiry with `jsonwebtoken`
pub struct JwtTokenVerifier {
    issuer: String,
    audience: String,
    key: DecodingKey,
    algorithm: Algorithm,
    leeway: u64,
}

impl JwtTokenVerifier {
    /// HS256 tokens signed with the client secret
    pub fn hs256(config: &ServerClientConfig) -> ServerClientResult<Self> {
        Self::with_key(
            config,
            DecodingKey::from_secret(config.client_secret.as_bytes()),
            Algorithm::HS256,
        )
    }

    pub fn with_key(
        config: &ServerClientConfig,
        key: DecodingKey,
        algorithm: Algorithm,
    ) -> ServerClientResult<Self> {
        Ok(Self {
            issuer: config.issuer()?,
            audience: config.client_id.clone(),
            key,
            algorithm,
            leeway: config.token_leeway_seconds,
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway;
        validation
    }
}

fn invalid(err: jsonwebtoken::errors::Error) -> ServerClientError {
    ServerClientError::TokenValidation(err.to_string())
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> ServerClientResult<IdTokenClaims> {
        let claims = decode::<IdTokenClaims>(id_token, &self.key, &self.validation())
            .map_err(invalid)?
            .claims;

        if let Some(expected) = expected_nonce {
            if claims.nonce.as_deref() != Some(expected) {
                return Err(ServerClientError::TokenValidation(
                    "nonce mismatch".to_string(),
                ));
            }
        }

        Ok(claims)
    }

    async fn verify_logout_token(&self, logout_token: &str) -> ServerClientResult<LogoutClaims> {
        let mut validation = self.validation();
        validation.required_spec_claims.remove("exp");

        let claims = decode::<LogoutTokenClaims>(logout_token, &self.key, &validation)
            .map_err(|e| ServerClientError::BackchannelLogout(e.to_string()))?
            .claims;

        let has_event = claims
            .events
            .as_ref()
            .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT));
        if !has_event {
            return Err(ServerClientError::BackchannelLogout(
                "logout token is missing the backchannel logout event".to_string(),
            ));
        }
        if claims.nonce.is_some() {
            return Err(ServerClientError::BackchannelLogout(
                "logout token must not contain a nonce".to_string(),
            ));
        }
        if claims.sub.is_none() && claims.sid.is_none() {
            return Err(ServerClientError::BackchannelLogout(
                "logout token must contain sub or sid".to_string(),
            ));
        }

        Ok(LogoutClaims {
            sub: claims.sub,
            sid: claims.sid,
        })
    }
}
