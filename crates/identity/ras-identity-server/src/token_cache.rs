//! Access token cache with single-flight refresh.
//!
//! Concurrent requests for the same `(session, key)` share one in-flight
//! refresh and all observe its result, success or failure. The flight removes
//! its own map entry when it finishes.

use crate::config::{DEFAULT_AUDIENCE, ServerClientConfig};
use crate::error::{ServerClientError, ServerClientResult};
use crate::idp::IdpClient;
use crate::types::{ConnectionTokenRequest, RefreshTokenRequest};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use ras_identity_store::{CacheKey, CachedToken, StateStore, StoreOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Flight = Shared<BoxFuture<'static, ServerClientResult<CachedToken>>>;
type FlightKey = (String, CacheKey);

#[derive(Clone)]
pub struct TokenCache {
    config: Arc<ServerClientConfig>,
    state_store: Arc<dyn StateStore>,
    idp: Arc<dyn IdpClient>,
    in_flight: Arc<Mutex<HashMap<FlightKey, Flight>>>,
}

impl TokenCache {
    pub fn new(
        config: Arc<ServerClientConfig>,
        state_store: Arc<dyn StateStore>,
        idp: Arc<dyn IdpClient>,
    ) -> Self {
        Self {
            config,
            state_store,
            idp,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return a usable access token for `key`, refreshing it if needed.
    ///
    /// `login_hint` is only sent for connection keys.
    pub async fn get_token(
        &self,
        session_id: &str,
        key: &CacheKey,
        login_hint: Option<&str>,
        store_options: &StoreOptions,
    ) -> ServerClientResult<String> {
        let session = self
            .state_store
            .get(session_id, store_options)
            .await?
            .ok_or(ServerClientError::MissingRefreshToken)?;

        if let Some(token) = session.fresh_token(key, self.config.token_expiry_skew()) {
            debug!("Serving cached access token for session {}", session_id);
            return Ok(token.access_token.clone());
        }
        if session.refresh_token.is_none() {
            return Err(ServerClientError::MissingRefreshToken);
        }

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry((session_id.to_string(), key.clone()))
                .or_insert_with(|| {
                    self.start_flight(
                        session_id.to_string(),
                        key.clone(),
                        login_hint.map(String::from),
                        store_options.clone(),
                    )
                })
                .clone()
        };

        Ok(flight.await?.access_token)
    }

    /// Number of refreshes currently in flight
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn start_flight(
        &self,
        session_id: String,
        key: CacheKey,
        login_hint: Option<String>,
        store_options: StoreOptions,
    ) -> Flight {
        let cache = self.clone();
        async move {
            let result = cache
                .refresh(&session_id, &key, login_hint.as_deref(), &store_options)
                .await;
            cache.in_flight.lock().await.remove(&(session_id, key));
            result
        }
        .boxed()
        .shared()
    }

    async fn refresh(
        &self,
        session_id: &str,
        key: &CacheKey,
        login_hint: Option<&str>,
        store_options: &StoreOptions,
    ) -> ServerClientResult<CachedToken> {
        // A flight that finished just before this one was installed may
        // already have stored a fresh token.
        let session = self
            .state_store
            .get(session_id, store_options)
            .await?
            .ok_or(ServerClientError::MissingRefreshToken)?;
        if let Some(token) = session.fresh_token(key, self.config.token_expiry_skew()) {
            return Ok(token.clone());
        }
        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or(ServerClientError::MissingRefreshToken)?;

        let response = match &key.connection {
            Some(connection) => {
                self.idp
                    .exchange_connection_token(ConnectionTokenRequest {
                        refresh_token,
                        connection: connection.clone(),
                        login_hint: login_hint.map(String::from),
                    })
                    .await
            }
            None => {
                let scope = key.scope_string();
                self.idp
                    .refresh_token(RefreshTokenRequest {
                        refresh_token,
                        audience: (key.audience != DEFAULT_AUDIENCE)
                            .then(|| key.audience.clone()),
                        scope: (!scope.is_empty()).then_some(scope),
                    })
                    .await
            }
        }
        .map_err(|e| {
            warn!("Token refresh for session {} failed: {}", session_id, e);
            ServerClientError::from_idp(e, ServerClientError::RefreshFailed)
        })?;

        let token = response.to_cached_token();

        let Some(mut latest) = self.state_store.get(session_id, store_options).await? else {
            // Logged out while the refresh was running
            debug!("Session {} disappeared during refresh", session_id);
            return Ok(token);
        };
        if latest.user.sub != session.user.sub
            || latest.internal.issued_at != session.internal.issued_at
        {
            // Replaced by another login while the refresh was running
            debug!("Session {} changed hands during refresh", session_id);
            return Ok(token);
        }
        latest.insert_token(key.clone(), token.clone());
        if !key.is_connection() {
            if let Some(rotated) = response.refresh_token {
                latest.refresh_token = Some(rotated);
            }
            if let Some(id_token) = response.id_token {
                latest.id_token = id_token;
            }
        }
        self.state_store
            .set(session_id, latest, store_options)
            .await?;

        info!("Refreshed access token for session {}", session_id);
        Ok(token)
    }
}
