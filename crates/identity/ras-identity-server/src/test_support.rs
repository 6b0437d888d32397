//! Fakes and fixtures shared by the unit tests.

use crate::config::ServerClientConfig;
use crate::error::{IdpError, OAuthErrorResponse};
use crate::idp::{IdpClient, IdpResult};
use crate::types::{
    BackchannelAuthorizeRequest, BackchannelAuthorizeResponse, CodeExchangeRequest,
    ConnectionTokenRequest, RefreshTokenRequest, TokenResponse,
};
use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header, encode};
use chrono::Utc;
use ras_identity_store::{
    LogoutClaims, SessionRecord, StateStore, StoreError, StoreOptions, StoreResult,
    TransactionRecord, TransactionStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const TEST_DOMAIN: &str = "auth.example.com";
pub const TEST_CLIENT_ID: &str = "test-client";
pub const TEST_SECRET: &str = "test-client-secret-with-enough-entropy";
pub const TEST_REDIRECT_URI: &str = "http://localhost:3000/auth/callback";

pub fn test_config() -> ServerClientConfig {
    ServerClientConfig::new(TEST_DOMAIN, TEST_CLIENT_ID, TEST_SECRET)
        .with_redirect_uri(TEST_REDIRECT_URI)
}

pub fn mint_token(claims: serde_json::Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn id_token_for(sub: &str, nonce: Option<&str>, sid: Option<&str>) -> String {
    let now = chrono::Utc::now().timestamp();
    let mut claims = serde_json::json!({
        "iss": format!("https://{}/", TEST_DOMAIN),
        "aud": TEST_CLIENT_ID,
        "iat": now,
        "exp": now + 3600,
        "sub": sub,
        "name": "Test User",
        "email": "test@example.com",
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = serde_json::json!(nonce);
    }
    if let Some(sid) = sid {
        claims["sid"] = serde_json::json!(sid);
    }
    mint_token(claims)
}

pub fn token_response(
    access_token: &str,
    expires_in: u64,
    refresh_token: Option<&str>,
    id_token: Option<String>,
) -> TokenResponse {
    TokenResponse {
        access_token: access_token.to_string(),
        token_type: "Bearer".to_string(),
        expires_in: Some(expires_in),
        refresh_token: refresh_token.map(String::from),
        scope: None,
        id_token,
    }
}

pub fn provider_error(code: &str) -> IdpError {
    IdpError::Provider(OAuthErrorResponse::new(code, Some("scripted")))
}

/// Query parameters of an authorization URL
pub fn query_of(url: &str) -> HashMap<String, String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Callback URL the provider would redirect to after a successful login
pub fn callback_for(authorize_url: &str, code: &str) -> String {
    let state = &query_of(authorize_url)["state"];
    format!("{}?code={}&state={}", TEST_REDIRECT_URI, code, state)
}

fn next<T>(queue: &Mutex<VecDeque<IdpResult<T>>>, call: &str) -> IdpResult<T> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(IdpError::InvalidResponse(format!("unexpected {}", call))))
}

/// Scripted [`IdpClient`] recording every call
#[derive(Default)]
pub struct FakeIdpClient {
    code_responses: Mutex<VecDeque<IdpResult<TokenResponse>>>,
    refresh_responses: Mutex<VecDeque<IdpResult<TokenResponse>>>,
    connection_responses: Mutex<VecDeque<IdpResult<TokenResponse>>>,
    authorize_responses: Mutex<VecDeque<IdpResult<BackchannelAuthorizeResponse>>>,
    poll_responses: Mutex<VecDeque<IdpResult<TokenResponse>>>,
    refresh_delay: Option<Duration>,
    poll_delay: Option<Duration>,

    pub code_requests: Mutex<Vec<CodeExchangeRequest>>,
    pub refresh_requests: Mutex<Vec<RefreshTokenRequest>>,
    pub connection_requests: Mutex<Vec<ConnectionTokenRequest>>,
    pub authorize_requests: Mutex<Vec<BackchannelAuthorizeRequest>>,
    pub poll_instants: Mutex<Vec<tokio::time::Instant>>,
    calls: AtomicUsize,
}

impl FakeIdpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes and connection exchanges sleep before answering
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    /// Backchannel polls sleep before answering
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    pub fn push_code_response(&self, response: IdpResult<TokenResponse>) {
        self.code_responses.lock().unwrap().push_back(response);
    }

    pub fn push_refresh_response(&self, response: IdpResult<TokenResponse>) {
        self.refresh_responses.lock().unwrap().push_back(response);
    }

    pub fn push_connection_response(&self, response: IdpResult<TokenResponse>) {
        self.connection_responses.lock().unwrap().push_back(response);
    }

    pub fn push_authorize_response(&self, response: IdpResult<BackchannelAuthorizeResponse>) {
        self.authorize_responses.lock().unwrap().push_back(response);
    }

    pub fn push_poll_response(&self, response: IdpResult<TokenResponse>) {
        self.poll_responses.lock().unwrap().push_back(response);
    }

    /// Total number of provider calls of any kind
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_requests.lock().unwrap().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connection_requests.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> usize {
        self.poll_instants.lock().unwrap().len()
    }
}

#[async_trait]
impl IdpClient for FakeIdpClient {
    async fn exchange_code(&self, request: CodeExchangeRequest) -> IdpResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.code_requests.lock().unwrap().push(request);
        next(&self.code_responses, "code exchange")
    }

    async fn refresh_token(&self, request: RefreshTokenRequest) -> IdpResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_requests.lock().unwrap().push(request);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        next(&self.refresh_responses, "refresh")
    }

    async fn exchange_connection_token(
        &self,
        request: ConnectionTokenRequest,
    ) -> IdpResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.connection_requests.lock().unwrap().push(request);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        next(&self.connection_responses, "connection exchange")
    }

    async fn backchannel_authorize(
        &self,
        request: BackchannelAuthorizeRequest,
    ) -> IdpResult<BackchannelAuthorizeResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.authorize_requests.lock().unwrap().push(request);
        next(&self.authorize_responses, "backchannel authorize")
    }

    async fn poll_backchannel(&self, _auth_req_id: &str) -> IdpResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.poll_instants
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        next(&self.poll_responses, "backchannel poll")
    }
}

/// Transaction store counting deletes.
///
/// Records are kept until deleted and returned even after `expires_at`,
/// like a backing store without TTL support.
#[derive(Default)]
pub struct CountingTransactionStore {
    records: Mutex<HashMap<String, TransactionRecord>>,
    deletes: AtomicUsize,
}

impl CountingTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Move every stored transaction past its expiry
    pub fn expire_all(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for record in self.records.lock().unwrap().values_mut() {
            record.expires_at = past;
        }
    }
}

#[async_trait]
impl TransactionStore for CountingTransactionStore {
    async fn set(
        &self,
        identifier: &str,
        record: TransactionRecord,
        _options: &StoreOptions,
    ) -> StoreResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(identifier.to_string(), record);
        Ok(())
    }

    async fn get(
        &self,
        identifier: &str,
        _options: &StoreOptions,
    ) -> StoreResult<Option<TransactionRecord>> {
        Ok(self.records.lock().unwrap().get(identifier).cloned())
    }

    async fn delete(&self, identifier: &str, _options: &StoreOptions) -> StoreResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().remove(identifier);
        Ok(())
    }
}

/// Store whose backend is down
pub struct UnavailableStore;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl TransactionStore for UnavailableStore {
    async fn set(&self, _: &str, _: TransactionRecord, _: &StoreOptions) -> StoreResult<()> {
        unavailable()
    }

    async fn get(&self, _: &str, _: &StoreOptions) -> StoreResult<Option<TransactionRecord>> {
        unavailable()
    }

    async fn delete(&self, _: &str, _: &StoreOptions) -> StoreResult<()> {
        unavailable()
    }
}

#[async_trait]
impl StateStore for UnavailableStore {
    async fn set(&self, _: &str, _: SessionRecord, _: &StoreOptions) -> StoreResult<()> {
        unavailable()
    }

    async fn get(&self, _: &str, _: &StoreOptions) -> StoreResult<Option<SessionRecord>> {
        unavailable()
    }

    async fn delete(&self, _: &str, _: &StoreOptions) -> StoreResult<()> {
        unavailable()
    }

    async fn delete_by_logout_token(&self, _: &LogoutClaims, _: &StoreOptions) -> StoreResult<()> {
        unavailable()
    }
}
