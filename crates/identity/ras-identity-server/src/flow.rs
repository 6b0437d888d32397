//! Authorization code flow with PKCE.
//!
//! `start` persists a [`TransactionRecord`] and hands back the provider's
//! authorization URL. `complete` consumes that record exactly once: it is
//! deleted as soon as it has been read, before any check or network call, so a
//! replayed callback always fails with [`ServerClientError::InvalidState`].

use crate::config::{AuthorizationParams, DEFAULT_AUDIENCE, ServerClientConfig};
use crate::error::{OAuthErrorResponse, ServerClientError, ServerClientResult};
use crate::idp::IdpClient;
use crate::pkce::{PkceChallenge, random_token};
use crate::types::{CodeExchangeRequest, StartLoginOptions};
use crate::verifier::TokenVerifier;
use ras_identity_store::{
    AppState, CacheKey, SessionRecord, StoreOptions, TransactionKind, TransactionRecord,
    TransactionStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Parameters generated by the flow itself; never taken from caller input
const PROTOCOL_PARAMS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "response_type",
    "code_challenge",
    "code_challenge_method",
    "state",
    "nonce",
    "scope",
    "audience",
];

/// Result of a successfully completed callback
#[derive(Debug, Clone)]
pub struct CompletedFlow {
    pub session: SessionRecord,
    pub app_state: Option<AppState>,
    pub kind: TransactionKind,
}

#[derive(Clone)]
pub struct AuthorizationCodeFlow {
    config: Arc<ServerClientConfig>,
    transaction_store: Arc<dyn TransactionStore>,
    idp: Arc<dyn IdpClient>,
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthorizationCodeFlow {
    pub fn new(
        config: Arc<ServerClientConfig>,
        transaction_store: Arc<dyn TransactionStore>,
        idp: Arc<dyn IdpClient>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            config,
            transaction_store,
            idp,
            verifier,
        }
    }

    fn transaction_key(&self, state: &str) -> String {
        format!("{}:{}", self.config.transaction_identifier, state)
    }

    /// Persist a new transaction and build the authorization URL.
    ///
    /// Parameters are layered as configured defaults, then `options`, then
    /// `extra_params`. `redirect_uri`, `audience` and `scope` are read from the
    /// merged set before the protocol parameters are written.
    pub async fn start(
        &self,
        kind: TransactionKind,
        options: StartLoginOptions,
        extra_params: AuthorizationParams,
        store_options: &StoreOptions,
    ) -> ServerClientResult<Url> {
        let mut params = self.config.authorization_params.clone();
        params.extend(options.authorization_params);
        params.extend(extra_params);

        let redirect_uri = params
            .get("redirect_uri")
            .cloned()
            .or_else(|| self.config.redirect_uri.clone())
            .ok_or(ServerClientError::MissingRequiredArgument("redirect_uri"))?;
        let audience = params
            .get("audience")
            .cloned()
            .or_else(|| self.config.audience.clone());
        let scope = self.config.resolve_scope(params.get("scope").map(String::as_str));

        let pkce = PkceChallenge::new();
        let state = random_token(32);
        let nonce = random_token(32);

        let record = TransactionRecord::new(
            uuid::Uuid::new_v4().to_string(),
            kind,
            pkce.code_verifier.clone(),
            state.clone(),
            nonce.clone(),
            redirect_uri.clone(),
            audience.clone(),
            scope.clone(),
            options.app_state,
            self.config.transaction_ttl_seconds,
        );
        let flow_id = record.flow_id.clone();

        self.transaction_store
            .set(&self.transaction_key(&state), record, store_options)
            .await?;

        let mut url = self.config.endpoint("authorize")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &redirect_uri);
            query.append_pair("response_type", "code");
            query.append_pair("code_challenge", &pkce.code_challenge);
            query.append_pair("code_challenge_method", &pkce.code_challenge_method);
            query.append_pair("state", &state);
            query.append_pair("nonce", &nonce);
            query.append_pair("scope", &scope);
            if let Some(audience) = &audience {
                query.append_pair("audience", audience);
            }

            for (key, value) in &params {
                if !PROTOCOL_PARAMS.contains(&key.as_str()) {
                    query.append_pair(key, value);
                }
            }
        }

        debug!("Started {:?} flow {}", kind, flow_id);
        Ok(url)
    }

    /// Handle the provider callback for a transaction of `expected_kind`
    pub async fn complete(
        &self,
        session_id: &str,
        callback_url: &str,
        expected_kind: TransactionKind,
        store_options: &StoreOptions,
    ) -> ServerClientResult<CompletedFlow> {
        let callback = Url::parse(callback_url)?;
        let query: HashMap<String, String> = callback
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        let state = query.get("state").ok_or(ServerClientError::InvalidState)?;
        let key = self.transaction_key(state);

        let transaction = self
            .transaction_store
            .get(&key, store_options)
            .await?
            .ok_or(ServerClientError::InvalidState)?;
        self.transaction_store.delete(&key, store_options).await?;

        if transaction.is_expired() || transaction.kind != expected_kind {
            warn!(
                "Rejected callback for flow {} (kind {:?}, expected {:?})",
                transaction.flow_id, transaction.kind, expected_kind
            );
            return Err(ServerClientError::InvalidState);
        }

        if let Some(error) = query.get("error") {
            let response = OAuthErrorResponse::new(
                error.as_str(),
                query.get("error_description").map(String::as_str),
            );
            warn!("Provider returned an error for flow {}: {}", transaction.flow_id, response);
            return Err(ServerClientError::AuthorizationError(response));
        }

        let code = query
            .get("code")
            .ok_or(ServerClientError::MissingRequiredArgument("code"))?;

        let tokens = self
            .idp
            .exchange_code(CodeExchangeRequest {
                code: code.clone(),
                code_verifier: transaction.code_verifier.clone(),
                redirect_uri: transaction.redirect_uri.clone(),
            })
            .await
            .map_err(|e| ServerClientError::from_idp(e, ServerClientError::AuthorizationError))?;

        let id_token = tokens.id_token.clone().ok_or_else(|| {
            ServerClientError::TokenValidation("token response has no id_token".to_string())
        })?;
        let claims = self
            .verifier
            .verify_id_token(&id_token, Some(&transaction.nonce))
            .await?;

        let mut session = SessionRecord::new(
            session_id.to_string(),
            claims.user_claims()?,
            id_token,
            tokens.refresh_token.clone(),
            claims.sid.clone(),
        );
        session.insert_token(
            CacheKey::new(
                transaction
                    .audience
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
                &transaction.scope,
            ),
            tokens.to_cached_token(),
        );

        info!(
            "Completed {:?} flow {} for subject {}",
            transaction.kind, transaction.flow_id, session.user.sub
        );

        Ok(CompletedFlow {
            session,
            app_state: transaction.app_state,
            kind: transaction.kind,
        })
    }
}
