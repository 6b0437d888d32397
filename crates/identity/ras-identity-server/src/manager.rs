//! Session manager tying the flows, the token cache and the stores together.

use crate::ciba::BackchannelFlow;
use crate::config::{AuthorizationParams, DEFAULT_AUDIENCE, ServerClientConfig};
use crate::error::{ServerClientError, ServerClientResult};
use crate::flow::AuthorizationCodeFlow;
use crate::idp::{HttpIdpClient, IdpClient};
use crate::token_cache::TokenCache;
use crate::types::{
    AccessTokenOptions, ConnectionTokenOptions, LinkResult, LoginBackchannelOptions, LoginResult,
    LogoutOptions, SessionData, StartLinkUserOptions, StartLoginOptions,
};
use crate::verifier::{JwtTokenVerifier, TokenVerifier};
use ras_identity_store::{
    CacheKey, InMemoryStateStore, InMemoryTransactionStore, SessionRecord, StateStore,
    StoreOptions, TransactionKind, TransactionStore, UserClaims,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LINK_SCOPE: &str = "openid link_account offline_access";

/// Builder for [`ServerClient`]; unset collaborators fall back to defaults
pub struct ServerClientBuilder {
    config: ServerClientConfig,
    transaction_store: Option<Arc<dyn TransactionStore>>,
    state_store: Option<Arc<dyn StateStore>>,
    idp_client: Option<Arc<dyn IdpClient>>,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
}

impl ServerClientBuilder {
    pub fn new(config: ServerClientConfig) -> Self {
        Self {
            config,
            transaction_store: None,
            state_store: None,
            idp_client: None,
            token_verifier: None,
        }
    }

    pub fn transaction_store(mut self, store: Arc<dyn TransactionStore>) -> Self {
        self.transaction_store = Some(store);
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn idp_client(mut self, client: Arc<dyn IdpClient>) -> Self {
        self.idp_client = Some(client);
        self
    }

    pub fn token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.token_verifier = Some(verifier);
        self
    }

    pub fn build(self) -> ServerClientResult<ServerClient> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let transaction_store: Arc<dyn TransactionStore> = match self.transaction_store {
            Some(store) => store,
            None => Arc::new(InMemoryTransactionStore::new()),
        };
        let state_store: Arc<dyn StateStore> = match self.state_store {
            Some(store) => store,
            None => Arc::new(InMemoryStateStore::new()),
        };
        let idp: Arc<dyn IdpClient> = match self.idp_client {
            Some(client) => client,
            None => Arc::new(HttpIdpClient::new(config.clone())?),
        };
        let verifier: Arc<dyn TokenVerifier> = match self.token_verifier {
            Some(verifier) => verifier,
            None => Arc::new(JwtTokenVerifier::hs256(&config)?),
        };

        debug!("Built server client for {}", config.domain);

        Ok(ServerClient {
            code_flow: AuthorizationCodeFlow::new(
                config.clone(),
                transaction_store,
                idp.clone(),
                verifier.clone(),
            ),
            backchannel: BackchannelFlow::new(config.clone(), idp.clone()),
            token_cache: TokenCache::new(config.clone(), state_store.clone(), idp),
            config,
            state_store,
            verifier,
        })
    }
}

/// Server-side OIDC client managing login flows and sessions
#[derive(Clone)]
pub struct ServerClient {
    config: Arc<ServerClientConfig>,
    state_store: Arc<dyn StateStore>,
    verifier: Arc<dyn TokenVerifier>,
    code_flow: AuthorizationCodeFlow,
    backchannel: BackchannelFlow,
    token_cache: TokenCache,
}

impl ServerClient {
    /// Client with in-memory stores and the HTTP provider client
    pub fn new(config: ServerClientConfig) -> ServerClientResult<Self> {
        ServerClientBuilder::new(config).build()
    }

    pub fn builder(config: ServerClientConfig) -> ServerClientBuilder {
        ServerClientBuilder::new(config)
    }

    pub fn config(&self) -> &ServerClientConfig {
        &self.config
    }

    pub async fn start_login(
        &self,
        options: StartLoginOptions,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        let url = self
            .code_flow
            .start(
                TransactionKind::Login,
                options,
                AuthorizationParams::new(),
                store_options,
            )
            .await?;
        Ok(url.to_string())
    }

    /// Complete an interactive login and store the session under `session_id`.
    ///
    /// Logging in again as the same user keeps access tokens cached for other
    /// audiences.
    pub async fn complete_login(
        &self,
        session_id: &str,
        callback_url: &str,
        store_options: &StoreOptions,
    ) -> ServerClientResult<LoginResult> {
        let completed = self
            .code_flow
            .complete(session_id, callback_url, TransactionKind::Login, store_options)
            .await?;

        let mut session = completed.session;
        if let Some(existing) = self.state_store.get(session_id, store_options).await? {
            if existing.user.sub == session.user.sub {
                carry_over(existing, &mut session);
            }
        }

        self.state_store
            .set(session_id, session.clone(), store_options)
            .await?;
        info!("User {} logged in", session.user.sub);

        Ok(LoginResult {
            session,
            app_state: completed.app_state,
        })
    }

    pub async fn start_link_user(
        &self,
        session_id: &str,
        options: StartLinkUserOptions,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        let session = self
            .state_store
            .get(session_id, store_options)
            .await?
            .filter(|session| !session.id_token.is_empty())
            .ok_or_else(|| {
                ServerClientError::StartLinkUser(
                    "Unable to start the user linking process without a logged in user. \
                     Ensure to login using the SDK before starting the user linking process."
                        .to_string(),
                )
            })?;

        let mut link_params = AuthorizationParams::new();
        link_params.insert("requested_connection".to_string(), options.connection);
        if let Some(scope) = options.connection_scope {
            link_params.insert("requested_connection_scope".to_string(), scope);
        }
        link_params.insert("id_token_hint".to_string(), session.id_token);
        link_params.insert("scope".to_string(), LINK_SCOPE.to_string());

        let url = self
            .code_flow
            .start(
                TransactionKind::LinkUser,
                StartLoginOptions {
                    authorization_params: options.authorization_params,
                    app_state: options.app_state,
                },
                link_params,
                store_options,
            )
            .await?;
        Ok(url.to_string())
    }

    /// Complete account linking and merge the result into the current session
    pub async fn complete_link_user(
        &self,
        session_id: &str,
        callback_url: &str,
        store_options: &StoreOptions,
    ) -> ServerClientResult<LinkResult> {
        let completed = self
            .code_flow
            .complete(
                session_id,
                callback_url,
                TransactionKind::LinkUser,
                store_options,
            )
            .await?;

        let linked = completed.session;
        let merged = match self.state_store.get(session_id, store_options).await? {
            Some(mut existing) => {
                existing.user = linked.user;
                existing.id_token = linked.id_token;
                if linked.refresh_token.is_some() {
                    existing.refresh_token = linked.refresh_token;
                }
                if linked.internal.sid.is_some() {
                    existing.internal.sid = linked.internal.sid;
                }
                existing.token_cache.extend(linked.token_cache);
                existing
            }
            None => linked,
        };

        info!("Linked account for user {}", merged.user.sub);
        self.state_store
            .set(session_id, merged, store_options)
            .await?;

        Ok(LinkResult {
            app_state: completed.app_state,
        })
    }

    /// Authenticate a user on their own device and store the resulting session
    pub async fn login_backchannel(
        &self,
        session_id: &str,
        options: LoginBackchannelOptions,
        cancel: &CancellationToken,
        store_options: &StoreOptions,
    ) -> ServerClientResult<SessionRecord> {
        let tokens = self.backchannel.login(&options, cancel).await?;

        let id_token = tokens.id_token.clone().ok_or_else(|| {
            ServerClientError::TokenValidation("token response has no id_token".to_string())
        })?;
        let claims = self.verifier.verify_id_token(&id_token, None).await?;

        let requested = |name: &str| {
            options
                .authorization_params
                .get(name)
                .map(String::as_str)
        };
        let audience = self
            .config
            .resolve_audience(requested("audience"))
            .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());
        let scope = self.config.resolve_scope(requested("scope"));

        let mut session = SessionRecord::new(
            session_id.to_string(),
            claims.user_claims()?,
            id_token,
            tokens.refresh_token.clone(),
            claims.sid.clone(),
        );
        session.insert_token(CacheKey::new(audience, &scope), tokens.to_cached_token());

        self.state_store
            .set(session_id, session.clone(), store_options)
            .await?;
        info!("User {} logged in via backchannel", session.user.sub);

        Ok(session)
    }

    pub async fn get_user(
        &self,
        session_id: &str,
        store_options: &StoreOptions,
    ) -> ServerClientResult<Option<UserClaims>> {
        Ok(self
            .state_store
            .get(session_id, store_options)
            .await?
            .map(|session| session.user))
    }

    pub async fn get_session(
        &self,
        session_id: &str,
        store_options: &StoreOptions,
    ) -> ServerClientResult<Option<SessionData>> {
        Ok(self
            .state_store
            .get(session_id, store_options)
            .await?
            .map(SessionData::from))
    }

    pub async fn get_access_token(
        &self,
        session_id: &str,
        options: &AccessTokenOptions,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        let key = CacheKey::new(
            self.config
                .resolve_audience(options.audience.as_deref())
                .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
            &self.config.resolve_scope(options.scope.as_deref()),
        );
        self.token_cache
            .get_token(session_id, &key, None, store_options)
            .await
    }

    pub async fn get_access_token_for_connection(
        &self,
        session_id: &str,
        options: &ConnectionTokenOptions,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        self.token_cache
            .get_token(
                session_id,
                &CacheKey::for_connection(options.connection.clone()),
                options.login_hint.as_deref(),
                store_options,
            )
            .await
    }

    /// Drop the local session and return the provider logout URL
    pub async fn logout(
        &self,
        session_id: &str,
        options: &LogoutOptions,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        self.state_store.delete(session_id, store_options).await?;

        let mut url = self.config.endpoint("v2/logout")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            if let Some(return_to) = &options.return_to {
                query.append_pair("returnTo", return_to);
            }
        }

        debug!("Session {} logged out", session_id);
        Ok(url.to_string())
    }

    /// Remove every session named by a provider-issued logout token
    pub async fn handle_backchannel_logout(
        &self,
        logout_token: &str,
        store_options: &StoreOptions,
    ) -> ServerClientResult<()> {
        if logout_token.is_empty() {
            return Err(ServerClientError::BackchannelLogout(
                "Missing logout token".to_string(),
            ));
        }

        let claims = self
            .verifier
            .verify_logout_token(logout_token)
            .await
            .inspect_err(|e| warn!("Rejected backchannel logout: {}", e))?;

        self.state_store
            .delete_by_logout_token(&claims, store_options)
            .await?;
        Ok(())
    }
}

/// Keep tokens and the refresh token of a previous login by the same user
fn carry_over(existing: SessionRecord, session: &mut SessionRecord) {
    for (key, token) in existing.token_cache {
        session.token_cache.entry(key).or_insert(token);
    }
    if session.refresh_token.is_none() {
        session.refresh_token = existing.refresh_token;
    }
}
